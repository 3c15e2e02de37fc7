//! MITM TLS interceptor.
//!
//! Terminates TLS toward the client on a hijacked CONNECT socket, then serves
//! successive decrypted HTTP/1.1 requests through the forwarder. A single
//! session may carry many request/response pairs on the shared tunnel.

use crate::forward::Forwarder;
use crate::mitm::manager::{MitmError, MitmManager};
use crate::traffic::host_only;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("issue leaf cert: {0}")]
    Leaf(#[from] MitmError),

    #[error("tls handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error("read mitm request failed: {0}")]
    Session(hyper::Error),
}

/// Drive one MITM session over an upgraded CONNECT socket.
///
/// Per-request records are emitted by the forwarder; the returned error only
/// covers session-level failures (leaf issuance, handshake, stream reads).
pub async fn serve_mitm(
    forwarder: Arc<Forwarder>,
    upgraded: hyper::upgrade::Upgraded,
    peer: SocketAddr,
    target: String,
    shutdown: CancellationToken,
) -> Result<(), InterceptError> {
    let host = host_only(&target).to_string();
    let identity = forwarder.mitm.leaf_for_host(&host)?;
    let tls_config = MitmManager::server_config(&identity)?;

    let acceptor = TlsAcceptor::from(tls_config);
    let tls_stream = acceptor
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(InterceptError::Handshake)?;
    debug!(host = %host, "mitm tls established");

    let session_target = target.clone();
    let service = service_fn(move |req| {
        let forwarder = Arc::clone(&forwarder);
        let target = session_target.clone();
        async move {
            Ok::<_, Infallible>(forwarder.mitm_request(req, peer, target).await)
        }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(tls_stream), service);
    tokio::pin!(conn);
    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                return result.map_err(InterceptError::Session);
            }
            _ = shutdown.cancelled(), if !draining => {
                // Let the in-flight exchange finish; start no new reads.
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}
