use std::path::PathBuf;

use pcm_types::LogLevel;

pub use pcm_player::config::FeederConfig;

/// Where raw PCM is read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PcmSource {
    Stdin,
    File(PathBuf),
}

impl PcmSource {
    /// `-` selects stdin; anything else is a file path.
    pub fn from_arg(path: PathBuf) -> Self {
        if path.as_os_str() == "-" {
            PcmSource::Stdin
        } else {
            PcmSource::File(path)
        }
    }
}

#[derive(Clone, Debug)]
pub struct BridgePlayConfig {
    pub source: PcmSource,
    pub device: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes read from the source per feed request.
    pub feed_bytes: usize,
    /// Play into an in-memory sink paced at real time instead of a device.
    pub dry_run: bool,
    pub log_level: LogLevel,
    pub feeder: FeederConfig,
}
