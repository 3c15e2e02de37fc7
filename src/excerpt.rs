//! Bounded excerpt capture: limited buffers, an advisory pool, and a tee
//! stream that copies body bytes without altering the stream itself.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// Append-only byte accumulator with a fixed ceiling.
///
/// Writes past the ceiling are dropped but reported as accepted, so an
/// upstream copy loop never stalls on the excerpt path.
#[derive(Debug)]
pub struct BoundedBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Append up to the remaining capacity and report the full input length.
    pub fn write(&mut self, chunk: &[u8]) -> usize {
        let remaining = self.limit.saturating_sub(self.buf.len());
        if remaining > 0 {
            let take = remaining.min(chunk.len());
            self.buf.extend_from_slice(&chunk[..take]);
        }
        chunk.len()
    }

    /// Accumulated contents, zero-copy.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Clear the buffer and update the ceiling.
    pub fn reset(&mut self, limit: usize) {
        self.buf.clear();
        self.limit = limit;
    }
}

/// Handle shared between a tee and the record assembly at stream end.
pub type SharedBuffer = Arc<Mutex<BoundedBuffer>>;

/// Advisory free-list of excerpt buffers.
///
/// `release` only reclaims storage when the handle is no longer shared;
/// correctness never depends on reuse.
#[derive(Debug)]
pub struct BufferPool {
    limit: usize,
    free: Mutex<Vec<BoundedBuffer>>,
}

impl BufferPool {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Hand out a buffer that behaves as empty.
    pub fn acquire(&self) -> SharedBuffer {
        let mut buf = {
            let mut free = self.free.lock().unwrap();
            free.pop().unwrap_or_else(|| BoundedBuffer::new(self.limit))
        };
        buf.reset(self.limit);
        Arc::new(Mutex::new(buf))
    }

    /// Return a buffer to the free list if the caller held the last handle.
    pub fn release(&self, handle: SharedBuffer) {
        if let Ok(mutex) = Arc::try_unwrap(handle) {
            let buf = mutex.into_inner().unwrap_or_else(|p| p.into_inner());
            self.free.lock().unwrap().push(buf);
        }
    }
}

/// Body chunks as the rest of the crate sees them.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Stream adapter that forwards chunks unchanged while copying them into a
/// bounded buffer owned by the caller.
pub struct TeeStream {
    inner: ByteStream,
    buf: SharedBuffer,
}

impl TeeStream {
    pub fn new<S>(inner: S, buf: SharedBuffer) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: inner.boxed(),
            buf,
        }
    }
}

impl Stream for TeeStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.buf.lock().unwrap().write(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}
