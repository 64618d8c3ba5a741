//! Output device discovery and format negotiation.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - finding a stream config that plays s16 PCM at the requested rate/channels unchanged
//! - deriving the minimum device buffer for that config

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::SinkError;
use crate::sink::SinkConfig;

/// Pick a CPAL output device.
///
/// If `needle` is `Some`, chooses the first output device whose name contains the substring
/// (case-insensitive). Otherwise, returns the host default output device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device, SinkError> {
    if let Some(needle) = needle {
        let mut devices = host
            .output_devices()
            .map_err(|e| SinkError::NoDevice(e.to_string()))?;
        return devices
            .find(|d| {
                d.description()
                    .ok()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| SinkError::NoDevice(format!("no output device matched: {needle}")));
    }

    host.default_output_device()
        .ok_or_else(|| SinkError::NoDevice("no default output device".to_string()))
}

/// Find a supported output config for `sink` without channel mapping or resampling.
///
/// Only ranges whose channel count equals the requested count and whose rate range contains
/// the requested rate qualify; among those, the format closest to s16 wins.
pub fn find_output_config(
    device: &cpal::Device,
    sink: &SinkConfig,
) -> Result<cpal::SupportedStreamConfig, SinkError> {
    let ranges = device
        .supported_output_configs()
        .map_err(|e| SinkError::Query(e.to_string()))?;

    let mut best: Option<(u8, cpal::SupportedStreamConfigRange)> = None;
    for range in ranges {
        if !range_supports(
            range.channels(),
            range.min_sample_rate(),
            range.max_sample_rate(),
            sink,
        ) {
            continue;
        }
        let rank = sample_format_rank(range.sample_format());
        if best.as_ref().is_none_or(|(b_rank, _)| rank < *b_rank) {
            best = Some((rank, range));
        }
    }

    best.map(|(_, range)| range.with_sample_rate(sink.sample_rate))
        .ok_or(SinkError::UnsupportedFormat {
            sample_rate: sink.sample_rate,
            channels: sink.channels,
        })
}

/// Buffer size for a config, in frames, and the CPAL buffer setting that realizes it.
///
/// A reported range yields its minimum, raised to `floor_frames` (but never above the
/// maximum). `Unknown` falls back to 20 ms of audio and lets CPAL pick the device default.
pub fn pick_buffer_frames(
    buffer_size: &cpal::SupportedBufferSize,
    sample_rate: u32,
    floor_frames: u32,
) -> (u32, Option<cpal::BufferSize>) {
    match buffer_size {
        cpal::SupportedBufferSize::Range { min, max } => {
            let chosen = clamp_buffer_frames(*min, *max, floor_frames);
            (chosen, Some(cpal::BufferSize::Fixed(chosen)))
        }
        cpal::SupportedBufferSize::Unknown => ((sample_rate / 50).max(floor_frames), None),
    }
}

/// Print available output devices to stdout.
///
/// This is intended for CLI UX (`--list-devices`) rather than structured output.
pub fn list_devices(host: &cpal::Host) -> Result<(), SinkError> {
    let devices = host
        .output_devices()
        .map_err(|e| SinkError::NoDevice(e.to_string()))?;
    for (i, d) in devices.enumerate() {
        match d.description() {
            Ok(desc) => println!("#{i}: {desc}"),
            Err(e) => println!("#{i}: <unavailable: {e}>"),
        }
    }
    Ok(())
}

fn range_supports(channels: u16, min_rate: u32, max_rate: u32, sink: &SinkConfig) -> bool {
    channels == sink.channels && (min_rate..=max_rate).contains(&sink.sample_rate)
}

fn clamp_buffer_frames(min: u32, max: u32, floor: u32) -> u32 {
    min.max(floor).min(max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::I16 => 0,
        cpal::SampleFormat::F32 => 1,
        cpal::SampleFormat::I32 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }

    #[test]
    fn range_supports_requires_exact_channels() {
        let mono = SinkConfig::new(16_000, 1);
        assert!(range_supports(1, 8_000, 48_000, &mono));
        assert!(!range_supports(2, 8_000, 48_000, &mono));
    }

    #[test]
    fn range_supports_requires_rate_in_range() {
        let cfg = SinkConfig::new(96_000, 2);
        assert!(!range_supports(2, 8_000, 48_000, &cfg));
        assert!(range_supports(2, 96_000, 96_000, &cfg));
    }

    #[test]
    fn buffer_range_uses_min_raised_to_floor() {
        let size = cpal::SupportedBufferSize::Range { min: 64, max: 4096 };
        let (frames, setting) = pick_buffer_frames(&size, 48_000, 256);
        assert_eq!(frames, 256);
        assert!(matches!(setting, Some(cpal::BufferSize::Fixed(256))));
    }

    #[test]
    fn buffer_range_keeps_large_min() {
        let size = cpal::SupportedBufferSize::Range { min: 1024, max: 4096 };
        assert_eq!(pick_buffer_frames(&size, 48_000, 256).0, 1024);
    }

    #[test]
    fn buffer_floor_never_exceeds_max() {
        assert_eq!(clamp_buffer_frames(16, 128, 256), 128);
    }

    #[test]
    fn unknown_buffer_size_falls_back_to_twenty_ms() {
        let (frames, setting) =
            pick_buffer_frames(&cpal::SupportedBufferSize::Unknown, 48_000, 256);
        assert_eq!(frames, 960);
        assert!(setting.is_none());
    }

    #[test]
    fn s16_is_preferred_format() {
        assert!(sample_format_rank(cpal::SampleFormat::I16) < sample_format_rank(cpal::SampleFormat::F32));
    }
}
