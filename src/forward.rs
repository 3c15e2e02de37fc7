//! The forwarder: clones inbound requests, applies policy, round-trips the
//! shared upstream client, streams the response back, and emits exactly one
//! audit record per interaction.

use crate::config::Config;
use crate::excerpt::{BufferPool, ByteStream, SharedBuffer, TeeStream};
use crate::filters::FilterChain;
use crate::mitm::MitmManager;
use crate::profiles::ProfileRegistry;
use crate::record::{client_addr, AuditRecord, ConnInfo, RequestSummary, ResponseSummary};
use crate::redact::sanitize_headers;
use crate::sink::AuditSink;
use crate::traffic::{host_allowed, RequestView, ResponseView};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt, TryStreamExt};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, Method, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, warn};

/// Response body handed back to hyper: either a short canned message or the
/// instrumented upstream stream.
pub type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

pub(crate) fn full_body(text: impl Into<Bytes>) -> ProxyBody {
    Full::new(text.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(format!("{message}\n")))
        .unwrap()
}

/// Write a record to the sink; sink failure is an operator problem, never a
/// client-visible one.
pub(crate) fn emit(sink: &Arc<dyn AuditSink>, record: &AuditRecord) {
    if let Err(e) = sink.record(record) {
        warn!(error = %e, "audit log write failed");
    }
}

/// Which path a request arrived on.
pub(crate) enum RouteKind {
    /// Plain proxied request (absolute-form URI from the client).
    Plain,
    /// Decrypted request read off a MITM tunnel toward `target`.
    Mitm { target: String },
}

/// Shared proxy data plane.
pub struct Forwarder {
    pub(crate) client: reqwest::Client,
    pub(crate) filters: FilterChain,
    pub(crate) profiles: ProfileRegistry,
    pub(crate) sink: Arc<dyn AuditSink>,
    pub(crate) mitm: Arc<MitmManager>,
    pub(crate) allow_hosts: Vec<String>,
    pub(crate) pool: Option<Arc<BufferPool>>,
    seq: AtomicU64,
}

impl Forwarder {
    pub fn new(cfg: &Config, sink: Arc<dyn AuditSink>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let filters = if cfg.filters.is_empty() {
            FilterChain::default_chain()
        } else {
            FilterChain::from_specs(&cfg.filters)
        };
        let profiles = ProfileRegistry::from_names(&cfg.profiles, &cfg.profiles_config)?;
        let mitm = Arc::new(MitmManager::from_config(cfg)?);
        let pool = (cfg.excerpt_limit > 0).then(|| Arc::new(BufferPool::new(cfg.excerpt_limit)));
        Ok(Self {
            client,
            filters,
            profiles,
            sink,
            mitm,
            allow_hosts: cfg.allow_hosts.clone(),
            pool,
            seq: AtomicU64::new(0),
        })
    }

    /// Swap the upstream client; lets tests point round-trips at servers with
    /// untrusted certificates.
    pub fn with_upstream_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub(crate) fn next_id(&self) -> String {
        format!("req-{}", self.seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn is_allowed(&self, target: &str) -> bool {
        host_allowed(&self.allow_hosts, target)
    }

    /// mitm attribute value for a plain-path record.
    fn mitm_label(&self, target: &str) -> &'static str {
        if self.mitm.intercepts(target) {
            "enabled"
        } else if self.mitm.enabled() {
            "skipped"
        } else {
            "disabled"
        }
    }

    /// Handle a non-CONNECT request from the listener.
    pub(crate) async fn proxy_request(
        &self,
        req: hyper::Request<Incoming>,
        peer: SocketAddr,
    ) -> Response<ProxyBody> {
        self.forward(req, peer, RouteKind::Plain).await
    }

    /// Handle one decrypted request read from a MITM tunnel.
    pub(crate) async fn mitm_request(
        &self,
        req: hyper::Request<Incoming>,
        peer: SocketAddr,
        target: String,
    ) -> Response<ProxyBody> {
        self.forward(req, peer, RouteKind::Mitm { target }).await
    }

    async fn forward(
        &self,
        req: hyper::Request<Incoming>,
        peer: SocketAddr,
        route: RouteKind,
    ) -> Response<ProxyBody> {
        let start = Instant::now();
        let wall = Utc::now();
        let id = self.next_id();

        let (parts, body) = req.into_parts();
        let method = parts.method.clone();
        let original_headers = parts.headers.clone();
        let client = client_addr(&original_headers, peer);

        // Normalize the outbound URI and pick the connection target.
        let mitm_session = matches!(route, RouteKind::Mitm { .. });
        let (uri, target) = match normalize_uri(&parts.uri, &original_headers, &route) {
            Ok(pair) => pair,
            Err(reason) => {
                let summary =
                    request_summary(&method, parts.uri.to_string(), &original_headers);
                self.emit_error(ErrorRecord {
                    id,
                    wall,
                    start,
                    client_addr: client,
                    target: String::new(),
                    protocol: "http",
                    request: Some(summary),
                    error: reason,
                    mitm_session,
                });
                return text_response(StatusCode::BAD_REQUEST, "bad request");
            }
        };
        let scheme = uri.scheme_str().unwrap_or("http");
        let protocol: &'static str = if mitm_session || scheme == "https" {
            "https"
        } else {
            "http"
        };

        let mut headers = original_headers.clone();
        headers.remove("proxy-connection");
        headers.remove("proxy-authenticate");
        headers.remove("proxy-authorization");
        if let RouteKind::Mitm { target } = &route {
            if let Ok(host) = target.parse() {
                headers.insert(HOST, host);
            }
        }

        // Allow-list applies on the plain path only; a MITM request already
        // passed it at CONNECT time.
        if !mitm_session && !self.is_allowed(&target) {
            let summary = request_summary(&method, uri.to_string(), &original_headers);
            self.emit_error(ErrorRecord {
                id,
                wall,
                start,
                client_addr: client,
                target: target.clone(),
                protocol: "http",
                request: Some(summary),
                error: format!("blocked host: {target}"),
                mitm_session,
            });
            return text_response(StatusCode::FORBIDDEN, "host not allowed");
        }

        // Request excerpt tee.
        let has_body = body.size_hint().exact() != Some(0);
        let mut request_buf: Option<SharedBuffer> = None;
        let outbound_body = if has_body {
            let stream = incoming_stream(body);
            if let Some(pool) = &self.pool {
                let buf = pool.acquire();
                request_buf = Some(Arc::clone(&buf));
                reqwest::Body::wrap_stream(TeeStream::new(stream, buf))
            } else {
                reqwest::Body::wrap_stream(stream)
            }
        } else {
            reqwest::Body::from(Vec::new())
        };

        // Request filters.
        let view = RequestView {
            method: &method,
            uri: &uri,
            headers: &headers,
        };
        if let Err(reject) = self.filters.apply_request(&view) {
            self.release(request_buf.take());
            return self.reject_request(
                RejectContext {
                    id,
                    wall,
                    start,
                    client_addr: client,
                    target,
                    protocol,
                    request: request_summary(&method, uri.to_string(), &original_headers),
                    mitm_session,
                },
                StatusCode::FORBIDDEN,
                &reject.to_string(),
                RejectPhase::Request,
            );
        }

        // Round-trip through the shared transport.
        let upstream = self
            .client
            .request(method.clone(), uri.to_string())
            .headers(headers.clone())
            .body(outbound_body)
            .send()
            .await;
        let upstream = match upstream {
            Ok(resp) => resp,
            Err(e) => {
                self.release(request_buf.take());
                return self.reject_request(
                    RejectContext {
                        id,
                        wall,
                        start,
                        client_addr: client,
                        target,
                        protocol,
                        request: request_summary(&method, uri.to_string(), &original_headers),
                        mitm_session,
                    },
                    StatusCode::BAD_GATEWAY,
                    &format!("upstream error: {e}"),
                    RejectPhase::Upstream,
                );
            }
        };

        let status = upstream.status();
        let resp_headers = upstream.headers().clone();
        let declared_len = upstream.content_length();

        // Response excerpt tee.
        let mut response_buf: Option<SharedBuffer> = None;
        let mut stream: ByteStream = upstream
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .boxed();
        if let Some(pool) = &self.pool {
            let buf = pool.acquire();
            response_buf = Some(Arc::clone(&buf));
            stream = TeeStream::new(stream, buf).boxed();
        }

        // Response filters.
        let resp_view = ResponseView {
            status,
            headers: &resp_headers,
        };
        if let Err(reject) = self.filters.apply_response(&resp_view) {
            self.release(request_buf.take());
            self.release(response_buf.take());
            return self.reject_request(
                RejectContext {
                    id,
                    wall,
                    start,
                    client_addr: client,
                    target,
                    protocol,
                    request: request_summary(&method, uri.to_string(), &original_headers),
                    mitm_session,
                },
                StatusCode::BAD_GATEWAY,
                &reject.to_string(),
                RejectPhase::Response,
            );
        }

        // Assemble everything that does not depend on the streamed body.
        let mut record = AuditRecord {
            time: wall,
            id,
            conn: ConnInfo {
                client_addr: client,
                target: target.clone(),
                protocol: protocol.to_string(),
            },
            request: Some(request_summary(&method, uri.to_string(), &original_headers)),
            response: Some(ResponseSummary {
                status: status.as_u16(),
                headers: sanitize_headers(&resp_headers),
                content_length: None,
            }),
            latency_ms: 0,
            profile: None,
            error: None,
            attributes: None,
        };
        let mitm_value = if mitm_session {
            "enabled"
        } else {
            self.mitm_label(&target)
        };
        record.set_attribute("mitm", mitm_value.into());

        if let Some(profile) = self.profiles.match_request(&view) {
            record.profile = Some(profile.name().to_string());
            let attrs = profile.annotate(&view, Some(&resp_view));
            record.merge_attributes(attrs);
        }

        debug!(id = %record.id, target = %target, status = status.as_u16(), "forwarded");

        // Copy headers verbatim, stream the body, finalize the record when
        // the stream ends (or the client goes away).
        let finisher = RecordFinisher {
            sink: Arc::clone(&self.sink),
            pool: self.pool.clone(),
            request_buf,
            response_buf,
            record,
            declared_len,
            start,
        };
        let audited = AuditedStream {
            inner: stream,
            finisher: Some(finisher),
            copied: 0,
        };
        let mut response = Response::new(audited_body(audited));
        *response.status_mut() = status;
        *response.headers_mut() = resp_headers;
        response
    }

    fn release(&self, buf: Option<SharedBuffer>) {
        if let (Some(pool), Some(buf)) = (&self.pool, buf) {
            pool.release(buf);
        }
    }

    /// Short-circuit a request with a canned response and one error record.
    fn reject_request(
        &self,
        ctx: RejectContext,
        status: StatusCode,
        reason: &str,
        phase: RejectPhase,
    ) -> Response<ProxyBody> {
        let (error, body): (String, String) = match (&phase, ctx.mitm_session) {
            (RejectPhase::Request, false) => {
                (format!("request filter rejected: {reason}"), "request blocked".to_string())
            }
            (RejectPhase::Request, true) => {
                (format!("request blocked: {reason}"), reason.to_string())
            }
            (RejectPhase::Upstream, false) => (reason.to_string(), "upstream error".to_string()),
            (RejectPhase::Upstream, true) => (reason.to_string(), reason.to_string()),
            (RejectPhase::Response, false) => {
                (format!("response filter rejected: {reason}"), "response blocked".to_string())
            }
            (RejectPhase::Response, true) => {
                (format!("response blocked: {reason}"), reason.to_string())
            }
        };

        let response = text_response(status, &body);
        let mut record = AuditRecord {
            time: ctx.wall,
            id: ctx.id,
            conn: ConnInfo {
                client_addr: ctx.client_addr,
                target: ctx.target,
                protocol: ctx.protocol.to_string(),
            },
            request: Some(ctx.request),
            response: None,
            latency_ms: ctx.start.elapsed().as_millis() as i64,
            profile: None,
            error: Some(error),
            attributes: None,
        };
        if ctx.mitm_session {
            // The wire response written back on the tunnel is part of the
            // interaction; summarize it.
            record.response = Some(ResponseSummary {
                status: status.as_u16(),
                headers: sanitize_headers(response.headers()),
                content_length: Some(body.len() as u64 + 1),
            });
            record.set_attribute("mitm", "enabled".into());
        }
        emit(&self.sink, &record);
        response
    }

    fn emit_error(&self, ctx: ErrorRecord) {
        let mut record = AuditRecord {
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
        if ctx.mitm_session {
            record.set_attribute("mitm", "enabled".into());
        }
        emit(&self.sink, &record);
    }
}

enum RejectPhase {
    Request,
    Upstream,
    Response,
}

struct RejectContext {
    id: String,
    wall: DateTime<Utc>,
    start: Instant,
    client_addr: String,
    target: String,
    protocol: &'static str,
    request: RequestSummary,
    mitm_session: bool,
}

struct ErrorRecord {
    id: String,
    wall: DateTime<Utc>,
    start: Instant,
    client_addr: String,
    target: String,
    protocol: &'static str,
    request: Option<RequestSummary>,
    error: String,
    mitm_session: bool,
}

/// Rebuild the outbound URI and derive the `host[:port]` target.
fn normalize_uri(
    uri: &Uri,
    headers: &HeaderMap,
    route: &RouteKind,
) -> Result<(Uri, String), String> {
    let (scheme, authority) = match route {
        RouteKind::Plain => {
            let scheme = uri.scheme_str().unwrap_or("http").to_string();
            let authority = uri
                .authority()
                .map(|a| a.to_string())
                .or_else(|| {
                    headers
                        .get(HOST)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                })
                .ok_or_else(|| "missing url host".to_string())?;
            (scheme, authority)
        }
        RouteKind::Mitm { target } => ("https".to_string(), target.clone()),
    };
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let rebuilt = Uri::builder()
        .scheme(scheme.as_str())
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| format!("invalid url: {e}"))?;
    Ok((rebuilt, authority))
}

pub(crate) fn request_summary(method: &Method, url: String, headers: &HeaderMap) -> RequestSummary {
    RequestSummary {
        method: method.to_string(),
        url,
        headers: sanitize_headers(headers),
        content_length: declared_content_length(headers),
    }
}

fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .filter(|len| *len > 0)
}

/// Flatten a hyper body into the crate's chunk stream.
fn incoming_stream(body: Incoming) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    BodyStream::new(body)
        .try_filter_map(|frame| std::future::ready(Ok(frame.into_data().ok())))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}

fn audited_body(stream: AuditedStream) -> ProxyBody {
    StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync()
}

/// Everything needed to complete the audit record once the response body has
/// been fully streamed (or abandoned).
struct RecordFinisher {
    sink: Arc<dyn AuditSink>,
    pool: Option<Arc<BufferPool>>,
    request_buf: Option<SharedBuffer>,
    response_buf: Option<SharedBuffer>,
    record: AuditRecord,
    declared_len: Option<u64>,
    start: Instant,
}

impl RecordFinisher {
    fn finish(mut self, copied: u64, stream_err: Option<&std::io::Error>) {
        if let Some(err) = stream_err {
            warn!(error = %err, id = %self.record.id, "stream copy failed");
        }
        self.record.latency_ms = self.start.elapsed().as_millis() as i64;
        if let Some(resp) = self.record.response.as_mut() {
            // Zero-length responses omit the field, like the request side.
            resp.content_length = Some(self.declared_len.unwrap_or(copied)).filter(|len| *len > 0);
        }
        if let Some(buf) = self.request_buf.take() {
            attach_excerpt(&mut self.record, &buf, "request_excerpt");
            if let Some(pool) = &self.pool {
                pool.release(buf);
            }
        }
        if let Some(buf) = self.response_buf.take() {
            attach_excerpt(&mut self.record, &buf, "response_excerpt");
            if let Some(pool) = &self.pool {
                pool.release(buf);
            }
        }
        emit(&self.sink, &self.record);
    }
}

fn attach_excerpt(record: &mut AuditRecord, buf: &SharedBuffer, key: &str) {
    let guard = buf.lock().unwrap();
    if !guard.is_empty() {
        let excerpt = String::from_utf8_lossy(guard.bytes()).into_owned();
        record.set_attribute(key, excerpt.into());
    }
}

/// Response stream wrapper that counts bytes and finalizes the record on
/// completion, error, or drop.
struct AuditedStream {
    inner: ByteStream,
    finisher: Option<RecordFinisher>,
    copied: u64,
}

impl Stream for AuditedStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.copied += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(finisher) = this.finisher.take() {
                    finisher.finish(this.copied, Some(&e));
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(finisher) = this.finisher.take() {
                    finisher.finish(this.copied, None);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AuditedStream {
    fn drop(&mut self) {
        // Client disconnects drop the body mid-stream; the interaction still
        // gets its record.
        if let Some(finisher) = self.finisher.take() {
            finisher.finish(self.copied, None);
        }
    }
}
