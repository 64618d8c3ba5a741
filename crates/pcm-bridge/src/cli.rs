use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pcm_types::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "pcm-bridge", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Ask for more samples when this many frames or fewer remain queued
    #[arg(long, default_value_t = 8000)]
    pub feed_threshold: u64,

    /// Playback thread wait on an empty queue (ms). Lower reacts faster to stop/release.
    #[arg(long, default_value_t = 10)]
    pub poll_ms: u64,

    /// Lower bound for the device buffer, in frames
    #[arg(long, default_value_t = 256)]
    pub min_buffer_floor: u32,

    /// Plugin log verbosity: none, error, standard, verbose
    #[arg(long, default_value = "verbose")]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream raw s16le interleaved PCM to the output device
    Play {
        /// Path to a raw PCM file, or `-` for stdin
        path: PathBuf,

        /// Sample rate of the input, in Hz
        #[arg(long)]
        sample_rate: u32,

        /// Interleaved channels in the input (1 or 2)
        #[arg(long)]
        channels: u16,

        /// Bytes read and fed per feed request
        #[arg(long, default_value_t = 32_000)]
        feed_bytes: usize,

        /// Play into an in-memory sink instead of a device
        #[arg(long)]
        dry_run: bool,
    },
}
