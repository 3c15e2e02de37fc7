//! Proxy listener: accepts connections, dispatches plain requests to the
//! forwarder and CONNECT requests to the raw tunnel or the MITM interceptor.

use crate::config::Config;
use crate::forward::{emit, full_body, request_summary, text_response, Forwarder, ProxyBody};
use crate::mitm::serve_mitm;
use crate::record::{client_addr, AuditRecord, ConnInfo, RequestSummary};
use crate::sink::AuditSink;
use crate::tunnel::{is_benign, splice, DIAL_TIMEOUT};
use chrono::{DateTime, Utc};
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The proxy server: listener plus the shared data plane.
pub struct ProxyServer {
    addr: String,
    forwarder: Forwarder,
    token: CancellationToken,
    shutdown_grace: Duration,
}

impl ProxyServer {
    /// Wire dependencies into a ready-to-run proxy.
    pub fn new(cfg: &Config, sink: Arc<dyn AuditSink>) -> anyhow::Result<Self> {
        // rustls needs a process-level crypto provider before any TLS use.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Ok(Self {
            addr: cfg.addr.clone(),
            forwarder: Forwarder::new(cfg, sink)?,
            token: CancellationToken::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    /// Swap the upstream client; test seam for upstreams with untrusted
    /// certificates.
    pub fn with_upstream_client(mut self, client: reqwest::Client) -> Self {
        self.forwarder = self.forwarder.with_upstream_client(client);
        self
    }

    /// How long to wait for in-flight handlers after shutdown is requested.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Token that stops the listener and drains handlers when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener until shutdown.
    pub async fn serve_on(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "proxy listening");
        let forwarder = Arc::new(self.forwarder);
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let forwarder = Arc::clone(&forwarder);
                    let token = self.token.clone();
                    let conn_tracker = tracker.clone();
                    tracker.spawn(async move {
                        serve_client(stream, peer, forwarder, token, conn_tracker).await;
                    });
                }
            }
        }

        drop(listener);
        tracker.close();
        if timeout(self.shutdown_grace, tracker.wait()).await.is_err() {
            warn!("shutdown grace period elapsed with handlers still running");
        }
        info!("proxy stopped");
        Ok(())
    }
}

/// Serve one inbound TCP connection with hyper; CONNECT upgrades enabled.
async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    forwarder: Arc<Forwarder>,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    let svc_forwarder = Arc::clone(&forwarder);
    let svc_token = token.clone();
    let service = service_fn(move |req| {
        let forwarder = Arc::clone(&svc_forwarder);
        let token = svc_token.clone();
        let tracker = tracker.clone();
        async move { Ok::<_, Infallible>(dispatch(forwarder, req, peer, token, tracker).await) }
    });

    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);
    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                // Non-HTTP bytes and abrupt closes land here; the connection
                // is dropped without a record.
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "connection ended");
                }
                return;
            }
            _ = token.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Route by method: CONNECT to the tunnel paths, everything else through the
/// forwarder.
async fn dispatch(
    forwarder: Arc<Forwarder>,
    req: Request<Incoming>,
    peer: SocketAddr,
    token: CancellationToken,
    tracker: TaskTracker,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        handle_connect(forwarder, req, peer, token, tracker).await
    } else {
        forwarder.proxy_request(req, peer).await
    }
}

/// CONNECT: allow-list check, reply 200, then hand the hijacked socket to the
/// MITM interceptor or the raw splice.
async fn handle_connect(
    forwarder: Arc<Forwarder>,
    mut req: Request<Incoming>,
    peer: SocketAddr,
    token: CancellationToken,
    tracker: TaskTracker,
) -> Response<ProxyBody> {
    let start = Instant::now();
    let wall = Utc::now();
    let id = forwarder.next_id();
    let target = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let client = client_addr(req.headers(), peer);
    let summary = request_summary(req.method(), req.uri().to_string(), req.headers());

    if !forwarder.is_allowed(&target) {
        log_error(
            &forwarder,
            LogError {
                id,
                wall,
                start,
                client_addr: client,
                target: target.clone(),
                protocol: "connect",
                request: Some(summary),
                error: format!("blocked host: {target}"),
            },
        );
        return text_response(StatusCode::FORBIDDEN, "host not allowed");
    }

    let mitm_enabled = forwarder.mitm.enabled();
    let intercept = forwarder.mitm.intercepts(&target);

    tracker.spawn(async move {
        let upgraded = match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                log_error(
                    &forwarder,
                    LogError {
                        id,
                        wall,
                        start,
                        client_addr: client,
                        target,
                        protocol: "connect",
                        request: Some(summary),
                        error: format!("hijack failed: {e}"),
                    },
                );
                return;
            }
        };

        if intercept {
            let session = serve_mitm(
                Arc::clone(&forwarder),
                upgraded,
                peer,
                target.clone(),
                token,
            )
            .await;
            if let Err(e) = session {
                log_error(
                    &forwarder,
                    LogError {
                        id,
                        wall,
                        start,
                        client_addr: client,
                        target,
                        protocol: "mitm",
                        request: Some(summary),
                        error: e.to_string(),
                    },
                );
            }
            return;
        }

        run_tunnel(
            forwarder,
            upgraded,
            RawTunnel {
                id,
                wall,
                start,
                client_addr: client,
                target,
                mitm_enabled,
            },
            summary,
        )
        .await;
    });

    Response::new(full_body(""))
}

struct RawTunnel {
    id: String,
    wall: DateTime<Utc>,
    start: Instant,
    client_addr: String,
    target: String,
    mitm_enabled: bool,
}

/// Dial the upstream and splice bytes verbatim; one record per tunnel.
async fn run_tunnel(
    forwarder: Arc<Forwarder>,
    upgraded: hyper::upgrade::Upgraded,
    ctx: RawTunnel,
    summary: RequestSummary,
) {
    let mut client_io = TokioIo::new(upgraded);

    let dialed = match timeout(DIAL_TIMEOUT, TcpStream::connect(&ctx.target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(format!("dial failed: {e}")),
        Err(_) => Err("dial failed: timed out".to_string()),
    };
    let mut upstream = match dialed {
        Ok(stream) => stream,
        Err(error) => {
            // The 200 is already on the wire; the failure goes out raw.
            let _ = client_io
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await;
            log_error(
                &forwarder,
                LogError {
                    id: ctx.id,
                    wall: ctx.wall,
                    start: ctx.start,
                    client_addr: ctx.client_addr,
                    target: ctx.target,
                    protocol: "connect",
                    request: Some(summary),
                    error,
                },
            );
            return;
        }
    };

    let error = match splice(&mut client_io, &mut upstream).await {
        Ok(_) => None,
        Err(e) if is_benign(&e) => None,
        Err(e) => Some(e.to_string()),
    };
    tunnel_record(&forwarder, ctx, error);
}

/// Record for a raw CONNECT tunnel: latency covers the whole splice, no
/// request/response sections.
fn tunnel_record(forwarder: &Forwarder, ctx: RawTunnel, error: Option<String>) {
    let mut record = AuditRecord {
        time: ctx.wall,
        id: ctx.id,
        conn: ConnInfo {
            client_addr: ctx.client_addr,
            target: ctx.target,
            protocol: "connect".to_string(),
        },
        request: None,
        response: None,
        latency_ms: ctx.start.elapsed().as_millis() as i64,
        profile: None,
        error,
        attributes: None,
    };
    let label = if ctx.mitm_enabled { "planned" } else { "disabled" };
    record.set_attribute("mitm", label.into());
    emit(&forwarder.sink, &record);
}

struct LogError {
    id: String,
    wall: DateTime<Utc>,
    start: Instant,
    client_addr: String,
    target: String,
    protocol: &'static str,
    request: Option<RequestSummary>,
    error: String,
}

fn log_error(forwarder: &Forwarder, ctx: LogError) {
    let record = AuditRecord {
        time: ctx.wall,
        id: ctx.id,
        conn: ConnInfo {
            client_addr: ctx.client_addr,
            target: ctx.target,
            protocol: ctx.protocol.to_string(),
        },
        request: ctx.request,
        response: None,
        latency_ms: ctx.start.elapsed().as_millis() as i64,
        profile: None,
        error: Some(ctx.error),
        attributes: None,
    };
    emit(&forwarder.sink, &record);
}
