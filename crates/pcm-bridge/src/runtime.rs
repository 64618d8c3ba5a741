//! Bridge runtime helpers.
//!
//! Provides device enumeration and the `play` loop that streams raw PCM through the
//! method channel, feeding on every request from the playback engine.

use std::io::Read;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use pcm_player::device;
use pcm_player::memory::{MemorySinkFactory, MemorySinkOptions};
use pcm_player::output::CpalSinkFactory;
use pcm_player::sink::SinkFactory;
use pcm_types::{MethodCall, MethodResponse, ON_FEED_SAMPLES, ON_PLAYBACK_FAULT};
use serde_json::json;

use crate::channel::MethodChannel;
use crate::config::{BridgePlayConfig, PcmSource};

/// Longest wait for a feed request before the session is considered stuck.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    device::list_devices(&host)?;
    Ok(())
}

/// Stream a raw PCM source to the output device until it is exhausted and drained.
pub fn run_play(config: BridgePlayConfig, install_ctrlc: bool) -> Result<()> {
    let factory: Arc<dyn SinkFactory> = if config.dry_run {
        Arc::new(MemorySinkFactory::new(MemorySinkOptions {
            realtime: true,
            ..MemorySinkOptions::default()
        }))
    } else {
        Arc::new(CpalSinkFactory::new(
            normalize_device_name(config.device.clone()),
            config.feeder.min_buffer_floor_frames,
        ))
    };

    let mut reader = open_source(&config.source)?;
    let channel = Arc::new(MethodChannel::spawn(factory, config.feeder.clone())?);

    if install_ctrlc {
        let channel_for_signal = Arc::downgrade(&channel);
        if let Err(e) = ctrlc::set_handler(move || {
            release_on_interrupt(&channel_for_signal);
            std::process::exit(130);
        }) {
            tracing::warn!("ctrl-c handler not installed: {e}");
        }
    }

    expect_success(
        &channel,
        MethodCall::new("setLogLevel", json!({ "log_level": config.log_level })),
    )?;
    expect_success(
        &channel,
        MethodCall::new(
            "setup",
            json!({ "sample_rate": config.sample_rate, "num_channels": config.channels }),
        ),
    )?;
    tracing::info!(
        source = ?config.source,
        sample_rate = config.sample_rate,
        channels = config.channels,
        dry_run = config.dry_run,
        "streaming pcm"
    );

    let frame_size = 2 * usize::from(config.channels);
    let block_bytes = config.feed_bytes.max(frame_size);
    let mut fed_bytes = 0u64;
    let mut tracker = DrainTracker::default();

    // A fresh session reports an empty queue right away; that is the cue for the first block.
    loop {
        let call = channel
            .callbacks()
            .recv_timeout(CALLBACK_TIMEOUT)
            .context("no feed request from playback engine")?;
        match call.method.as_str() {
            ON_FEED_SAMPLES => {
                let remaining = call.arguments["remaining_frames"].as_u64().unwrap_or(0);
                let mut step = tracker.on_feed_request(remaining);
                if step == Step::FeedNext {
                    let (block, at_end) = read_block(reader.as_mut(), block_bytes, frame_size)?;
                    if at_end {
                        tracker.mark_eof();
                    }
                    if block.is_empty() {
                        step = tracker.on_feed_request(remaining);
                    } else {
                        fed_bytes += block.len() as u64;
                        expect_success(&channel, MethodCall::new("feed", json!({ "buffer": block })))?;
                        step = Step::Wait;
                    }
                }
                match step {
                    Step::Confirm => {
                        expect_success(&channel, MethodCall::new("feed", json!({ "buffer": [] })))?
                    }
                    Step::Finish => break,
                    Step::FeedNext | Step::Wait => {}
                }
            }
            ON_PLAYBACK_FAULT => {
                let message = call.arguments["message"].as_str().unwrap_or("unknown");
                let _ = channel.invoke(MethodCall::bare("release"));
                bail!("playback fault: {message}");
            }
            other => tracing::debug!(method = other, "ignoring callback"),
        }
    }

    expect_success(&channel, MethodCall::bare("release"))?;
    tracing::info!(bytes = fed_bytes, "playback finished");
    Ok(())
}

/// What the play loop does with one feed request.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    FeedNext,
    /// Re-arm notifications with an empty feed and wait for a fresh report.
    Confirm,
    Finish,
    Wait,
}

/// Decides when the input has been fully played.
///
/// An empty-queue report can be computed just before the last block lands in the queue. After
/// end of input the first such report is answered with an empty feed; since every feed
/// re-arms notifications, the report that follows describes the queue after all feeds.
#[derive(Debug, Default)]
struct DrainTracker {
    eof: bool,
    confirming: bool,
}

impl DrainTracker {
    fn mark_eof(&mut self) {
        self.eof = true;
    }

    fn on_feed_request(&mut self, remaining_frames: u64) -> Step {
        if !self.eof {
            return Step::FeedNext;
        }
        if remaining_frames > 0 {
            return Step::Wait;
        }
        if self.confirming {
            return Step::Finish;
        }
        self.confirming = true;
        Step::Confirm
    }
}

/// Release the session if the channel is still alive. Returns whether a release was sent.
fn release_on_interrupt(channel: &Weak<MethodChannel>) -> bool {
    match channel.upgrade() {
        Some(channel) => channel.invoke(MethodCall::bare("release")).is_ok(),
        None => false,
    }
}

fn open_source(source: &PcmSource) -> Result<Box<dyn Read + Send>> {
    Ok(match source {
        PcmSource::Stdin => Box::new(std::io::stdin()),
        PcmSource::File(path) => Box::new(
            std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?,
        ),
    })
}

fn expect_success(channel: &MethodChannel, call: MethodCall) -> Result<()> {
    let method = call.method.clone();
    match channel.invoke(call)? {
        MethodResponse::Success(_) => Ok(()),
        MethodResponse::Error(err) => Err(err).with_context(|| format!("{method} failed")),
        MethodResponse::NotImplemented => bail!("{method} not implemented"),
    }
}

/// Read up to `max` bytes, trimmed to whole frames. Returns the block and whether the source
/// is exhausted. A trailing partial frame at end of input is dropped.
fn read_block(reader: &mut dyn Read, max: usize, frame_size: usize) -> Result<(Vec<u8>, bool)> {
    let want = max - max % frame_size;
    let mut block = vec![0u8; want];
    let mut filled = 0;
    let mut eof = false;
    while filled < want {
        match reader.read(&mut block[filled..]) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read pcm source"),
        }
    }
    let whole = filled - filled % frame_size;
    if whole != filled {
        tracing::warn!(dropped = filled - whole, "input ends with a partial frame");
    }
    block.truncate(whole);
    Ok((block, eof))
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
