//! End-to-end proxy tests: plain forwarding, filter rejection, allow-list
//! enforcement, excerpt capture, and raw CONNECT tunnels.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use wiretap::config::Config;
use wiretap::record::AuditRecord;
use wiretap::sink::{AuditSink, MemorySink};
use wiretap::ProxyServer;

// ============================================================================
// Helpers
// ============================================================================

/// Plain HTTP upstream: `/echo` returns `hello`, `/len` echoes the received
/// body length. Counts every request it serves.
async fn spawn_upstream(hits: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let hits = Arc::clone(&hits);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let response = match req.uri().path() {
                            "/len" => {
                                let body = req.into_body().collect().await.unwrap().to_bytes();
                                Response::new(Full::new(Bytes::from(body.len().to_string())))
                            }
                            _ => Response::builder()
                                .header("Content-Type", "text/plain")
                                .body(Full::new(Bytes::from_static(b"hello")))
                                .unwrap(),
                        };
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

struct ProxyHandle {
    addr: SocketAddr,
    sink: Arc<MemorySink>,
    token: CancellationToken,
}

async fn spawn_proxy(cfg: Config) -> ProxyHandle {
    let sink = Arc::new(MemorySink::new());
    let server = ProxyServer::new(&cfg, Arc::clone(&sink) as Arc<dyn AuditSink>).unwrap();
    let token = server.shutdown_token();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve_on(listener));
    ProxyHandle { addr, sink, token }
}

async fn wait_for_records(sink: &MemorySink, count: usize) -> Vec<AuditRecord> {
    for _ in 0..200 {
        if sink.len() >= count {
            return sink.records();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} records, got {}", sink.len());
}

fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy}")).unwrap())
        .build()
        .unwrap()
}

// ============================================================================
// Plain forwarding
// ============================================================================

#[tokio::test]
async fn plain_get_is_forwarded_and_recorded() {
    let upstream = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
    let proxy = spawn_proxy(Config::default()).await;
    let client = proxied_client(proxy.addr);

    let response = client
        .get(format!("http://{upstream}/echo"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello");

    let records = wait_for_records(&proxy.sink, 1).await;
    let record = &records[0];
    assert_eq!(record.conn.protocol, "http");
    assert_eq!(record.conn.target, upstream.to_string());
    assert_eq!(record.profile.as_deref(), Some("generic"));
    assert!(record.error.is_none());
    assert!(record.latency_ms >= 0);

    let response_summary = record.response.as_ref().unwrap();
    assert_eq!(response_summary.status, 200);
    assert_eq!(response_summary.content_length, Some(5));

    let request_summary = record.request.as_ref().unwrap();
    assert_eq!(request_summary.method, "GET");
    assert!(request_summary.url.contains("/echo"));

    let attrs = record.attributes.as_ref().unwrap();
    assert_eq!(attrs["mitm"], "disabled");

    proxy.token.cancel();
}

#[tokio::test]
async fn record_ids_are_unique_across_concurrent_requests() {
    let upstream = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
    let proxy = spawn_proxy(Config::default()).await;
    let client = proxied_client(proxy.addr);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let url = format!("http://{upstream}/echo");
        tasks.push(tokio::spawn(async move {
            client.get(url).send().await.unwrap().text().await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), "hello");
    }

    let records = wait_for_records(&proxy.sink, 8).await;
    let mut ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8, "request ids must be unique");

    proxy.token.cancel();
}

// ============================================================================
// Filters
// ============================================================================

#[tokio::test]
async fn default_filter_blocks_the_audit_header_without_upstream_contact() {
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = spawn_upstream(Arc::clone(&hits)).await;
    let proxy = spawn_proxy(Config::default()).await;
    let client = proxied_client(proxy.addr);

    let response = client
        .get(format!("http://{upstream}/echo"))
        .header("X-Audit-Block", "block")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let records = wait_for_records(&proxy.sink, 1).await;
    let record = &records[0];
    let error = record.error.as_deref().unwrap();
    assert!(error.contains("X-Audit-Block=block"), "error: {error}");
    assert!(record.response.is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 0, "upstream must not be contacted");

    proxy.token.cancel();
}

// ============================================================================
// Allow-list
// ============================================================================

#[tokio::test]
async fn plain_request_to_unlisted_host_is_blocked() {
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = spawn_upstream(Arc::clone(&hits)).await;
    let cfg = Config {
        allow_hosts: vec!["allowed.test".to_string()],
        ..Config::default()
    };
    let proxy = spawn_proxy(cfg).await;
    let client = proxied_client(proxy.addr);

    let response = client
        .get(format!("http://{upstream}/echo"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let records = wait_for_records(&proxy.sink, 1).await;
    let error = records[0].error.as_deref().unwrap();
    assert!(error.starts_with("blocked host: "), "error: {error}");
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    proxy.token.cancel();
}

#[tokio::test]
async fn connect_to_unlisted_host_is_refused() {
    let cfg = Config {
        allow_hosts: vec!["allowed.test".to_string()],
        ..Config::default()
    };
    let proxy = spawn_proxy(cfg).await;
    let client = proxied_client(proxy.addr);

    // The proxy answers the CONNECT with 403, which surfaces as an error.
    let result = client.get("https://blocked.test/").send().await;
    assert!(result.is_err());

    let records = wait_for_records(&proxy.sink, 1).await;
    let record = &records[0];
    assert_eq!(record.conn.protocol, "connect");
    let error = record.error.as_deref().unwrap();
    assert!(error.contains("blocked.test"), "error: {error}");

    proxy.token.cancel();
}

// ============================================================================
// Excerpts
// ============================================================================

#[tokio::test]
async fn large_body_passes_through_whole_with_capped_excerpt() {
    let upstream = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
    let cfg = Config {
        excerpt_limit: 1024,
        ..Config::default()
    };
    let proxy = spawn_proxy(cfg).await;
    let client = proxied_client(proxy.addr);

    let body: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
    let expected_prefix = String::from_utf8_lossy(&body[..1024]).into_owned();

    let response = client
        .post(format!("http://{upstream}/len"))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    // The upstream saw every byte.
    assert_eq!(response.text().await.unwrap(), "10240");

    let records = wait_for_records(&proxy.sink, 1).await;
    let attrs = records[0].attributes.as_ref().unwrap();
    let excerpt = attrs["request_excerpt"].as_str().unwrap();
    assert_eq!(excerpt, expected_prefix);

    proxy.token.cancel();
}

#[tokio::test]
async fn excerpt_limit_zero_disables_capture() {
    let upstream = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
    let cfg = Config {
        excerpt_limit: 0,
        ..Config::default()
    };
    let proxy = spawn_proxy(cfg).await;
    let client = proxied_client(proxy.addr);

    let response = client
        .post(format!("http://{upstream}/len"))
        .body("some request payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    // Drain the body so the record finalizes.
    let _ = response.text().await.unwrap();

    let records = wait_for_records(&proxy.sink, 1).await;
    if let Some(attrs) = records[0].attributes.as_ref() {
        assert!(!attrs.contains_key("request_excerpt"));
        assert!(!attrs.contains_key("response_excerpt"));
    }

    proxy.token.cancel();
}

#[tokio::test]
async fn response_excerpt_is_captured_when_enabled() {
    let upstream = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
    let cfg = Config {
        excerpt_limit: 3,
        ..Config::default()
    };
    let proxy = spawn_proxy(cfg).await;
    let client = proxied_client(proxy.addr);

    let response = client
        .get(format!("http://{upstream}/echo"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "hello");

    let records = wait_for_records(&proxy.sink, 1).await;
    let attrs = records[0].attributes.as_ref().unwrap();
    assert_eq!(attrs["response_excerpt"], "hel");

    proxy.token.cancel();
}

// ============================================================================
// Raw CONNECT tunnel
// ============================================================================

#[tokio::test]
async fn zero_byte_connect_tunnel_still_emits_a_record() {
    // Upstream that accepts and waits for EOF.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });

    let proxy = spawn_proxy(Config::default()).await;

    let mut conn = TcpStream::connect(proxy.addr).await.unwrap();
    conn.write_all(
        format!("CONNECT {upstream_addr} HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n").as_bytes(),
    )
    .await
    .unwrap();
    let mut buf = vec![0u8; 256];
    let n = conn.read(&mut buf).await.unwrap();
    let reply = String::from_utf8_lossy(&buf[..n]).into_owned();
    assert!(reply.starts_with("HTTP/1.1 200"), "reply: {reply}");
    drop(conn);

    let records = wait_for_records(&proxy.sink, 1).await;
    let record = &records[0];
    assert_eq!(record.conn.protocol, "connect");
    assert!(record.latency_ms >= 0);
    assert!(record.request.is_none());
    assert!(record.response.is_none());
    assert!(record.error.is_none());
    let attrs = record.attributes.as_ref().unwrap();
    assert_eq!(attrs["mitm"], "disabled");

    proxy.token.cancel();
}

#[tokio::test]
async fn connect_dial_failure_returns_502_through_the_tunnel() {
    let proxy = spawn_proxy(Config::default()).await;

    // A port nothing listens on: bind then drop.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let mut conn = TcpStream::connect(proxy.addr).await.unwrap();
    conn.write_all(
        format!("CONNECT {dead_addr} HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n").as_bytes(),
    )
    .await
    .unwrap();

    let mut reply = String::new();
    let mut buf = vec![0u8; 256];
    loop {
        let n = conn.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        reply.push_str(&String::from_utf8_lossy(&buf[..n]));
        if reply.contains("502") {
            break;
        }
    }
    assert!(reply.starts_with("HTTP/1.1 200"), "reply: {reply}");
    assert!(reply.contains("HTTP/1.1 502 Bad Gateway"), "reply: {reply}");

    let records = wait_for_records(&proxy.sink, 1).await;
    let error = records[0].error.as_deref().unwrap();
    assert!(error.starts_with("dial failed"), "error: {error}");

    proxy.token.cancel();
}
