//! Background input prefetching.
//!
//! When the recording arrives over a pipe, the producer on the far end can
//! stall if the decoder is busy chewing on a packet. The prefetcher
//! decouples the two: a background task drains the source into a growable
//! bounded buffer, and the decoder reads from the buffer, blocking only
//! when it is empty and the source still open.
//!
//! The buffer doubles its capacity up to a limit while the producer is
//! ahead, and unread bytes are shifted back to the start whenever the
//! read cursor crosses the high-water mark. This is a convenience for
//! pipe-fed inputs; file inputs can be handed to the decoder directly.

use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const DEFAULT_INITIAL_CAPACITY: usize = 64 * 1024;
const DEFAULT_MAX_CAPACITY: usize = 4 * 1024 * 1024;
const FILL_CHUNK: usize = 32 * 1024;

struct PrefetchState {
    /// Buffered bytes; `data[read_pos..]` is unread.
    data: Vec<u8>,
    read_pos: usize,
    /// Soft capacity; doubles up to the maximum while the producer leads.
    capacity: usize,
    max_capacity: usize,
    closed: bool,
    error: Option<io::Error>,
    consumer: Option<Waker>,
}

impl PrefetchState {
    fn unread(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Shift unread bytes down once the cursor is past the high-water
    /// mark, so the buffer does not creep forever.
    fn maybe_shift(&mut self) {
        if self.read_pos >= self.capacity / 2 {
            self.data.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }

    fn wake_consumer(&mut self) {
        if let Some(waker) = self.consumer.take() {
            waker.wake();
        }
    }
}

struct Shared {
    state: Mutex<PrefetchState>,
    /// Signalled by the consumer when buffer space frees up.
    space: Notify,
}

/// An `AsyncRead` adapter that prefetches its source in the background.
pub struct PrefetchReader {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl PrefetchReader {
    /// Spawns the background fill task for `source` with default buffer
    /// limits. Must be called within a tokio runtime.
    pub fn spawn<R>(source: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::with_capacity(source, DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY)
    }

    /// Spawns the background fill task with explicit initial and maximum
    /// buffer capacities.
    pub fn with_capacity<R>(mut source: R, initial: usize, max: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(PrefetchState {
                data: Vec::with_capacity(initial),
                read_pos: 0,
                capacity: initial,
                max_capacity: max.max(initial).max(FILL_CHUNK),
                closed: false,
                error: None,
                consumer: None,
            }),
            space: Notify::new(),
        });

        let task_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            let mut chunk = vec![0u8; FILL_CHUNK];
            loop {
                match source.read(&mut chunk).await {
                    Ok(0) => {
                        let mut state = task_shared.state.lock();
                        state.closed = true;
                        state.wake_consumer();
                        break;
                    }
                    Ok(n) => loop {
                        {
                            let mut state = task_shared.state.lock();
                            while state.data.len() + n > state.capacity
                                && state.capacity < state.max_capacity
                            {
                                state.capacity =
                                    (state.capacity.max(1) * 2).min(state.max_capacity);
                            }
                            if state.data.len() + n <= state.capacity {
                                state.data.extend_from_slice(&chunk[..n]);
                                state.wake_consumer();
                                break;
                            }
                        }
                        // buffer full at its limit: wait for the consumer
                        task_shared.space.notified().await;
                    },
                    Err(e) => {
                        let mut state = task_shared.state.lock();
                        state.error = Some(e);
                        state.closed = true;
                        state.wake_consumer();
                        break;
                    }
                }
            }
        });

        Self { shared, task }
    }
}

impl AsyncRead for PrefetchReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.state.lock();

        let unread = state.unread();
        if unread > 0 {
            let n = unread.min(buf.remaining());
            let start = state.read_pos;
            buf.put_slice(&state.data[start..start + n]);
            state.read_pos += n;
            state.maybe_shift();
            drop(state);
            self.shared.space.notify_one();
            return Poll::Ready(Ok(()));
        }

        if let Some(error) = state.error.take() {
            return Poll::Ready(Err(error));
        }
        if state.closed {
            return Poll::Ready(Ok(()));
        }

        state.consumer = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for PrefetchReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;
    use tokio::runtime::Runtime;

    #[test]
    fn test_reads_everything_through_the_buffer() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let source: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
            let mut reader = PrefetchReader::spawn(Cursor::new(source.clone()));

            let mut output = Vec::new();
            reader.read_to_end(&mut output).await.unwrap();
            assert_eq!(output, source);
        });
    }

    #[test]
    fn test_small_buffer_forces_growth_and_backpressure() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let source: Vec<u8> = (0..1_000_000u32).map(|i| (i / 7 % 256) as u8).collect();
            // tiny limits so doubling and the full-buffer wait both trigger
            let mut reader =
                PrefetchReader::with_capacity(Cursor::new(source.clone()), 1024, 64 * 1024);

            let mut output = Vec::new();
            let mut chunk = [0u8; 777];
            loop {
                let n = reader.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                output.extend_from_slice(&chunk[..n]);
            }
            assert_eq!(output.len(), source.len());
            assert_eq!(output, source);
        });
    }
}
