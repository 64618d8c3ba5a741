use thiserror::Error;

/// Failures reported by an audio sink or its factory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("no output device: {0}")]
    NoDevice(String),
    #[error("unsupported output format: {sample_rate} Hz, {channels} channel(s)")]
    UnsupportedFormat { sample_rate: u32, channels: u16 },
    #[error("device query failed: {0}")]
    Query(String),
    #[error("failed to open output stream: {0}")]
    Open(String),
    #[error("output stream error: {0}")]
    Stream(String),
    #[error("sink already released")]
    Released,
}

/// Reasons `setup` can refuse to configure a session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SetupError {
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(i64),
    #[error("unsupported channel count: {0} (expected 1 or 2)")]
    InvalidChannels(i64),
    #[error("Invalid buffer size.")]
    BufferSize(#[source] SinkError),
    #[error("AudioTrack initialization failed.")]
    Open(#[source] SinkError),
}

/// Errors from engine operations on a configured (or missing) session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("must call setup first")]
    NotConfigured,
    #[error("playback stopped after sink failure: {0}")]
    Faulted(String),
    #[error("buffer of {len} bytes is not a whole number of {frame_size}-byte frames")]
    PartialFrame { len: usize, frame_size: usize },
    #[error(transparent)]
    Sink(#[from] SinkError),
}
