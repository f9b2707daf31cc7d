//! Output buffer between a fetch session and the audio consumer.
//!
//! A fetch session pushes downloaded bytes into a [`Sink`] and watches its
//! pending length for backpressure. The default sink is a [`Buffer`], an
//! in-memory FIFO of chunks whose reading half is an [`AudioStream`]:
//!
//! * Decoder threads read it through blocking [`std::io::Read`]
//! * Async consumers read it through [`tokio::io::AsyncRead`]
//!
//! Dropping the [`AudioStream`] closes the buffer. The fetch session notices
//! and tears itself down.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use rangeplay::buffer::{self, Sink};
//! use tokio::io::AsyncReadExt;
//!
//! let (buffer, mut stream) = buffer::channel();
//! buffer.push(Bytes::from_static(b"OggS"));
//! buffer.finish();
//!
//! let mut data = Vec::new();
//! stream.read_to_end(&mut data).await?;
//! ```

use std::{
    collections::VecDeque,
    fmt, io,
    pin::Pin,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use tokio::{io::ReadBuf, sync::Notify};

/// Destination of downloaded bytes.
///
/// Implementations must accept chunks in arrival order and report how much
/// of what was pushed is still unread. A sink that offers time-seeking inside
/// the buffered container data can be put in place of [`Buffer`].
#[async_trait]
pub trait Sink: Send + Sync {
    /// Appends a chunk. Chunks pushed after the sink was closed are dropped.
    fn push(&self, chunk: Bytes);

    /// Marks that no more chunks will follow, so readers see end-of-stream
    /// after draining.
    fn finish(&self);

    /// Bytes pushed but not yet read.
    fn pending_len(&self) -> usize;

    /// Bytes read by the consumer so far.
    fn consumed(&self) -> u64;

    /// Whether the consumer went away, or the sink was destroyed.
    fn is_closed(&self) -> bool;

    /// Discards any pending data and closes the sink. Idempotent.
    fn destroy(&self);

    /// Resolves after the consumer read from, or closed, the sink.
    async fn changed(&self);
}

/// Writing half of an in-memory chunk queue.
#[derive(Clone)]
pub struct Buffer {
    shared: Arc<Shared>,
}

/// Reading half of an in-memory chunk queue.
///
/// Reads block (or return `Pending`) until data is available. End-of-stream
/// is reported after the writer finished and all data was read, or after the
/// buffer was destroyed.
pub struct AudioStream {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,

    /// Wakes blocking readers.
    readable: Condvar,

    /// Wakes the writer when the reader made progress.
    changed: Notify,
}

#[derive(Default)]
struct State {
    chunks: VecDeque<Bytes>,
    pending: usize,
    consumed: u64,
    finished: bool,
    closed: bool,

    /// Waker of an async reader waiting for data.
    waker: Option<Waker>,
}

impl State {
    /// Copies as much as fits into `dst` and returns how much that was.
    fn take_into(&mut self, dst: &mut [u8]) -> usize {
        let mut written = 0;
        while written < dst.len() {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };

            let n = front.len().min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&front[..n]);
            front.advance(n);
            written += n;

            if front.is_empty() {
                self.chunks.pop_front();
            }
        }

        self.pending -= written;
        self.consumed += written as u64;
        written
    }

    fn is_eof(&self) -> bool {
        self.chunks.is_empty() && (self.finished || self.closed)
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Creates a connected [`Buffer`] and [`AudioStream`].
#[must_use]
pub fn channel() -> (Buffer, AudioStream) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::default()),
        readable: Condvar::new(),
        changed: Notify::new(),
    });

    (
        Buffer {
            shared: Arc::clone(&shared),
        },
        AudioStream { shared },
    )
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.chunks.clear();
        state.pending = 0;
        state.wake_reader();
        drop(state);

        self.readable.notify_all();
        self.changed.notify_one();
    }
}

#[async_trait]
impl Sink for Buffer {
    fn push(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }

        let mut state = self.shared.state();
        if state.closed {
            return;
        }

        state.pending += chunk.len();
        state.chunks.push_back(chunk);
        state.wake_reader();
        drop(state);

        self.shared.readable.notify_all();
    }

    fn finish(&self) {
        let mut state = self.shared.state();
        state.finished = true;
        state.wake_reader();
        drop(state);

        self.shared.readable.notify_all();
    }

    fn pending_len(&self) -> usize {
        self.shared.state().pending
    }

    fn consumed(&self) -> u64 {
        self.shared.state().consumed
    }

    fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    fn destroy(&self) {
        self.shared.close();
    }

    async fn changed(&self) {
        self.shared.changed.notified().await;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Buffer")
            .field("pending", &state.pending)
            .field("consumed", &state.consumed)
            .field("finished", &state.finished)
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

impl AudioStream {
    /// Bytes read from this stream so far.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.shared.state().consumed
    }

    /// Bytes that can be read without waiting.
    #[must_use]
    pub fn available(&self) -> usize {
        self.shared.state().pending
    }
}

impl io::Read for AudioStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.shared.state();
        loop {
            if !state.chunks.is_empty() {
                let n = state.take_into(buf);
                drop(state);

                self.shared.changed.notify_one();
                return Ok(n);
            }

            if state.is_eof() {
                return Ok(0);
            }

            state = self
                .shared
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl tokio::io::AsyncRead for AudioStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut state = self.shared.state();
        if !state.chunks.is_empty() {
            let n = state.take_into(buf.initialize_unfilled());
            buf.advance(n);
            drop(state);

            self.shared.changed.notify_one();
            return Poll::Ready(Ok(()));
        }

        if state.is_eof() {
            return Poll::Ready(Ok(()));
        }

        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state();
        f.debug_struct("AudioStream")
            .field("available", &state.pending)
            .field("bytes_read", &state.consumed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn reads_in_push_order_until_finished() {
        let (buffer, mut stream) = channel();
        buffer.push(Bytes::from_static(b"hello "));
        buffer.push(Bytes::from_static(b"world"));
        assert_eq!(buffer.pending_len(), 11);

        buffer.finish();

        let mut data = Vec::new();
        AsyncReadExt::read_to_end(&mut stream, &mut data).await.unwrap();
        assert_eq!(data, b"hello world");
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.consumed(), 11);
    }

    #[tokio::test]
    async fn partial_reads_split_chunks() {
        let (buffer, mut stream) = channel();
        buffer.push(Bytes::from_static(b"abcdef"));

        let mut first = [0; 4];
        AsyncReadExt::read_exact(&mut stream, &mut first).await.unwrap();
        assert_eq!(&first, b"abcd");
        assert_eq!(buffer.pending_len(), 2);
        assert_eq!(stream.bytes_read(), 4);
    }

    #[tokio::test]
    async fn async_reader_waits_for_data() {
        let (buffer, mut stream) = channel();
        let reader = tokio::spawn(async move {
            let mut data = Vec::new();
            AsyncReadExt::read_to_end(&mut stream, &mut data).await.map(|_| data)
        });

        tokio::task::yield_now().await;
        buffer.push(Bytes::from_static(b"late"));
        buffer.finish();

        assert_eq!(reader.await.unwrap().unwrap(), b"late");
    }

    #[test]
    fn blocking_reader_waits_for_data() {
        let (buffer, mut stream) = channel();
        let reader = std::thread::spawn(move || {
            let mut data = Vec::new();
            Read::read_to_end(&mut stream, &mut data).map(|_| data)
        });

        buffer.push(Bytes::from_static(b"from another thread"));
        buffer.finish();

        assert_eq!(reader.join().unwrap().unwrap(), b"from another thread");
    }

    #[tokio::test]
    async fn dropping_reader_closes_buffer() {
        let (buffer, stream) = channel();
        buffer.push(Bytes::from_static(b"unread"));
        assert!(!buffer.is_closed());

        drop(stream);
        buffer.changed().await;

        assert!(buffer.is_closed());
        assert_eq!(buffer.pending_len(), 0);

        // Late chunks go nowhere.
        buffer.push(Bytes::from_static(b"ignored"));
        assert_eq!(buffer.pending_len(), 0);
    }

    #[tokio::test]
    async fn destroy_ends_stream_and_is_idempotent() {
        let (buffer, mut stream) = channel();
        buffer.push(Bytes::from_static(b"discarded"));

        buffer.destroy();
        buffer.destroy();

        let mut data = Vec::new();
        AsyncReadExt::read_to_end(&mut stream, &mut data).await.unwrap();
        assert!(data.is_empty());
    }
}
