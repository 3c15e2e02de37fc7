//! End-to-end smoke probe: starts a throwaway upstream and the proxy in one
//! process, sends a request through the proxy, and verifies the audit log
//! gained a record. Exits nonzero on any failure.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use wiretap::config::Config;
use wiretap::record::AuditRecord;
use wiretap::sink::{AuditSink, JsonlSink};
use wiretap::ProxyServer;

#[derive(Parser, Debug)]
#[command(name = "smokecheck", about = "wiretap end-to-end smoke probe")]
struct Args {
    /// Path to write JSONL audit output
    #[arg(long = "log-file", default_value = "logs/smoke.jsonl")]
    log_file: String,

    /// Listen address for the probe proxy
    #[arg(long, default_value = "127.0.0.1:18080")]
    addr: String,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Args::parse()).await {
        eprintln!("smokecheck failed: {e:#}");
        std::process::exit(1);
    }
    println!("smokecheck passed");
}

async fn run(args: Args) -> Result<()> {
    if args.log_file != "-" {
        match std::fs::remove_file(&args.log_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => bail!("failed to clean log file: {e}"),
        }
    }

    let upstream_addr = spawn_upstream().await?;

    let cfg = Config {
        addr: args.addr.clone(),
        log_file: args.log_file.clone(),
        ..Config::default()
    };
    let sink: Arc<dyn AuditSink> = Arc::new(JsonlSink::open(&cfg.log_file)?);
    let server = ProxyServer::new(&cfg, Arc::clone(&sink))?;
    let shutdown = server.shutdown_token();

    let listener = TcpListener::bind(&cfg.addr)
        .await
        .with_context(|| format!("binding {}", cfg.addr))?;
    let proxy_addr = listener.local_addr()?;
    let server_task = tokio::spawn(server.serve_on(listener));

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}"))?)
        .build()?;
    let response = client
        .get(format!("http://{upstream_addr}/echo"))
        .send()
        .await
        .context("http request via proxy")?;
    if response.status() != 200 {
        bail!("unexpected status {}", response.status());
    }
    let body = response.text().await?;
    if body != "ok" {
        bail!("unexpected body {body:?}");
    }

    shutdown.cancel();
    let joined = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .context("server did not confirm shutdown")?;
    joined.context("proxy task panicked")??;
    sink.flush()?;

    let contents = std::fs::read_to_string(&args.log_file).context("reading audit log")?;
    let mut found = false;
    for line in contents.lines() {
        let record: AuditRecord = serde_json::from_str(line).context("parsing audit record")?;
        if record.conn.protocol == "http"
            && record.response.as_ref().is_some_and(|r| r.status == 200)
        {
            found = true;
        }
    }
    if !found {
        bail!("no successful http record in {}", args.log_file);
    }
    Ok(())
}

/// Serve `200 ok` on an ephemeral port until the process exits.
async fn spawn_upstream() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(|_req: Request<Incoming>| async {
                    Ok::<_, Infallible>(
                        Response::builder()
                            .header("X-Smoke", "http")
                            .header("Content-Type", "text/plain")
                            .body(Full::new(Bytes::from_static(b"ok")))
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    Ok(addr)
}
