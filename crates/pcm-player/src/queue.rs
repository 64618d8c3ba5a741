//! Thread-safe unbounded FIFO of PCM chunks.
//!
//! The control surface enqueues chunks as they are fed; the playback thread dequeues them
//! with a bounded wait so it can keep checking its stop flag:
//! - `feed` → `enqueue_all`
//! - playback thread → `try_dequeue(poll_interval)`
//! - `stop` / teardown → `clear` / `close`
//!
//! Frame accounting is done by scanning the queued chunks, which keeps the queue free of
//! counters that could drift from its contents.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::chunk::PcmChunk;

/// Ordered queue of [`PcmChunk`]s shared by one producer and one consumer.
///
/// ## Design
/// - **Unbounded**: `enqueue` never blocks; memory pressure is the caller's concern.
/// - A single [`Condvar`] signals both "chunk available" and "queue closed".
/// - The `closed` flag lives under the same mutex as the chunks to avoid lost wakeups.
///
/// `frame_size` is fixed for the lifetime of the queue (`2 * channels` for s16le).
pub struct SampleQueue {
    frame_size: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

struct QueueInner {
    chunks: VecDeque<PcmChunk>,
    closed: bool,
}

impl SampleQueue {
    /// Create an empty queue for frames of `frame_size` bytes.
    ///
    /// # Panics
    /// Panics if `frame_size` is zero.
    pub fn new(frame_size: usize) -> Self {
        assert!(frame_size > 0, "frame_size must be non-zero");
        Self {
            frame_size,
            inner: Mutex::new(QueueInner {
                chunks: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one chunk and wake the consumer.
    pub fn enqueue(&self, chunk: PcmChunk) {
        let mut g = self.lock();
        g.chunks.push_back(chunk);
        drop(g);
        self.cv.notify_all();
    }

    /// Append chunks in order under a single lock acquisition.
    pub fn enqueue_all(&self, chunks: impl IntoIterator<Item = PcmChunk>) {
        let mut g = self.lock();
        let before = g.chunks.len();
        g.chunks.extend(chunks);
        let pushed_any = g.chunks.len() > before;
        drop(g);
        if pushed_any {
            self.cv.notify_all();
        }
    }

    /// Remove the oldest chunk, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout or once the queue has been closed. An empty result is not
    /// an error; it lets the caller re-check its own state.
    pub fn try_dequeue(&self, timeout: Duration) -> Option<PcmChunk> {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            if g.closed {
                return None;
            }
            if let Some(chunk) = g.chunks.pop_front() {
                return Some(chunk);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (ng, _timeout) = self
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            g = ng;
        }
    }

    /// Frames currently queued (snapshot taken under the queue lock).
    ///
    /// This value can change immediately after the call returns.
    pub fn remaining_frames(&self) -> u64 {
        let g = self.lock();
        let bytes: usize = g.chunks.iter().map(PcmChunk::len).sum();
        (bytes / self.frame_size) as u64
    }

    /// Number of queued chunks.
    pub fn len(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().chunks.is_empty()
    }

    /// Drop every queued chunk.
    pub fn clear(&self) {
        let mut g = self.lock();
        g.chunks.clear();
    }

    /// Mark the queue closed and wake all waiters.
    ///
    /// After this, `try_dequeue` returns `None` immediately. Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
