//! Audio sink seam.
//!
//! The playback engine only talks to [`AudioSink`]/[`SinkFactory`]; the CPAL backend lives in
//! [`crate::output`] and an in-memory backend in [`crate::memory`].

use std::sync::Arc;
use std::time::Duration;

use crate::error::SinkError;

/// Output stream format. Samples are always signed 16-bit little-endian, interleaved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

impl SinkConfig {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Bytes per interleaved frame.
    pub fn frame_size(&self) -> usize {
        2 * self.channels as usize
    }

    /// Playback duration of `bytes` worth of whole frames.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let frames = (bytes / self.frame_size()) as u64;
        Duration::from_nanos(frames.saturating_mul(1_000_000_000) / self.sample_rate as u64)
    }
}

/// Handle to an open output stream.
///
/// Every method takes `&self`: the control surface pauses/flushes while the playback thread
/// may be blocked inside [`AudioSink::write`].
pub trait AudioSink: Send + Sync {
    /// Start (or resume) rendering.
    fn play(&self) -> Result<(), SinkError>;

    /// Stop rendering without discarding accepted data.
    fn pause(&self) -> Result<(), SinkError>;

    /// Drop data accepted but not yet rendered.
    fn flush(&self);

    /// Hand `bytes` to the device, blocking until all of them are accepted.
    ///
    /// Blocking is the playback loop's rate limiter. Returns the number of bytes accepted.
    fn write(&self, bytes: &[u8]) -> Result<usize, SinkError>;

    /// Stop rendering.
    fn stop(&self);

    /// Free the device. Idempotent; unblocks a pending `write` with [`SinkError::Released`].
    fn release(&self);

    fn is_released(&self) -> bool;
}

/// Opens sinks and answers device capability queries.
pub trait SinkFactory: Send + Sync {
    /// Minimum device buffer size in bytes for `config`.
    fn min_buffer_size(&self, config: &SinkConfig) -> Result<usize, SinkError>;

    /// Open a streaming sink with a device buffer of `buffer_bytes`.
    fn open(&self, config: &SinkConfig, buffer_bytes: usize) -> Result<Arc<dyn AudioSink>, SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_is_two_bytes_per_channel() {
        assert_eq!(SinkConfig::new(16_000, 1).frame_size(), 2);
        assert_eq!(SinkConfig::new(48_000, 2).frame_size(), 4);
    }

    #[test]
    fn duration_of_counts_whole_frames() {
        let cfg = SinkConfig::new(16_000, 1);
        assert_eq!(cfg.duration_of(32_000), Duration::from_secs(1));
        assert_eq!(cfg.duration_of(1), Duration::ZERO);
        assert_eq!(SinkConfig::new(0, 1).duration_of(100), Duration::ZERO);
    }
}
