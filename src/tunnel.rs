//! Raw CONNECT tunnel: a bidirectional splice between the hijacked client
//! socket and the upstream TCP connection.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Upstream dial timeout for CONNECT targets.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Pipe bytes in both directions until both sides terminate. Returns the
/// (client→upstream, upstream→client) byte counts.
pub async fn splice<C, U>(client: &mut C, upstream: &mut U) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    U: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (sent, received) = tokio::io::copy_bidirectional(client, upstream).await?;
    debug!(sent, received, "tunnel closed");
    Ok((sent, received))
}

/// Terminations expected on a half-closed tunnel; these never become record
/// errors.
pub fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn reset_and_eof_are_benign() {
        assert!(is_benign(&io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
        assert!(is_benign(&io::Error::new(io::ErrorKind::UnexpectedEof, "eof")));
        assert!(is_benign(&io::Error::new(io::ErrorKind::BrokenPipe, "pipe")));
        assert!(!is_benign(&io::Error::new(io::ErrorKind::PermissionDenied, "denied")));
    }

    #[tokio::test]
    async fn splice_moves_bytes_both_ways() {
        let (mut client_side, mut proxy_client) = tokio::io::duplex(1024);
        let (mut proxy_upstream, mut upstream_side) = tokio::io::duplex(1024);

        let tunnel = tokio::spawn(async move {
            splice(&mut proxy_client, &mut proxy_upstream).await
        });

        client_side.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_side.write_all(b"pong").await.unwrap();
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_side);
        drop(upstream_side);
        let (sent, received) = tunnel.await.unwrap().unwrap();
        assert_eq!(sent, 4);
        assert_eq!(received, 4);
    }
}
