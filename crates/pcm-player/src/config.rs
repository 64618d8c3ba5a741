use std::time::Duration;

/// Largest chunk queued as one unit, in bytes.
pub const MAX_CHUNK_BYTES: usize = 200;

/// Frames below which the playback thread asks for more data, unless overridden.
pub const DEFAULT_FEED_THRESHOLD: u64 = 8000;

/// Feeder tuning parameters shared by the engine and the sink.
#[derive(Clone, Debug)]
pub struct FeederConfig {
    /// Chunk size cap for queued buffers, in bytes.
    pub max_chunk_bytes: usize,
    /// Bounded wait used by the playback thread when the queue is empty.
    ///
    /// Shorter values make stop/release more responsive at the cost of wakeups.
    pub poll_interval: Duration,
    /// Initial feed threshold in frames.
    pub default_feed_threshold: u64,
    /// Lower bound applied to the device-reported minimum buffer, in frames.
    pub min_buffer_floor_frames: u32,
}

impl Default for FeederConfig {
    /// Defaults tuned for speech/music feeders on common devices.
    fn default() -> Self {
        Self {
            max_chunk_bytes: MAX_CHUNK_BYTES,
            poll_interval: Duration::from_millis(10),
            default_feed_threshold: DEFAULT_FEED_THRESHOLD,
            min_buffer_floor_frames: 256,
        }
    }
}
