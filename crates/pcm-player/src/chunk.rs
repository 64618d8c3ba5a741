//! Splitting fed buffers into bounded chunks.
//!
//! Chunks are views into one shared allocation, so splitting a fed buffer costs one
//! `Arc` clone per chunk and no byte copies.

use std::ops::{Deref, Range};
use std::sync::Arc;

/// Immutable slice of interleaved s16le PCM shared with the buffer it was cut from.
#[derive(Clone)]
pub struct PcmChunk {
    buf: Arc<[u8]>,
    range: Range<usize>,
}

impl PcmChunk {
    /// Wrap a whole buffer as a single chunk.
    pub fn from_buffer(buf: Arc<[u8]>) -> Self {
        let len = buf.len();
        Self { buf, range: 0..len }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[self.range.clone()]
    }
}

impl Deref for PcmChunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl std::fmt::Debug for PcmChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmChunk")
            .field("range", &self.range)
            .finish()
    }
}

/// Split `buffer` into chunks of `max_chunk_bytes`, the last one holding the remainder.
///
/// An empty buffer yields no chunks.
///
/// # Panics
/// Panics if `max_chunk_bytes` is zero.
pub fn split(buffer: Arc<[u8]>, max_chunk_bytes: usize) -> Vec<PcmChunk> {
    assert!(max_chunk_bytes > 0, "max_chunk_bytes must be non-zero");

    let total = buffer.len();
    let mut chunks = Vec::with_capacity(total.div_ceil(max_chunk_bytes));
    let mut offset = 0;
    while offset < total {
        let end = (offset + max_chunk_bytes).min(total);
        chunks.push(PcmChunk {
            buf: buffer.clone(),
            range: offset..end,
        });
        offset = end;
    }
    chunks
}
