//! pcm-bridge: streams raw 16-bit PCM to an audio output through the feeder plugin.
//!
//! The playback engine asks for more samples whenever its queue runs low; this binary
//! answers each request with the next block of the input.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pcm_bridge::cli::{Args, Command};
use pcm_bridge::config::{BridgePlayConfig, FeederConfig, PcmSource};
use pcm_bridge::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,pcm_bridge=info,pcm_player=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let feeder = FeederConfig {
        poll_interval: Duration::from_millis(args.poll_ms.max(1)),
        default_feed_threshold: args.feed_threshold,
        min_buffer_floor_frames: args.min_buffer_floor,
        ..FeederConfig::default()
    };

    match args.cmd {
        Some(Command::Play {
            path,
            sample_rate,
            channels,
            feed_bytes,
            dry_run,
        }) => runtime::run_play(
            BridgePlayConfig {
                source: PcmSource::from_arg(path),
                device: args.device,
                sample_rate,
                channels,
                feed_bytes,
                dry_run,
                log_level: args.log_level,
                feeder,
            },
            true,
        ),
        None => bail!("no command given; try `pcm-bridge play --help`"),
    }
}
