//! Control surface: dispatches named method calls onto the playback engine.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crossbeam_channel::Sender;
use pcm_player::config::FeederConfig;
use pcm_player::engine::PlaybackEngine;
use pcm_player::error::{EngineError, SetupError};
use pcm_player::sink::SinkFactory;
use pcm_types::{FeederEvent, LogLevel, MethodCall, MethodError, MethodResponse};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Error code for setup and sink failures.
pub const CODE_AUDIO_TRACK: &str = "AudioTrackError";
/// Error code for calls that need a configured session.
pub const CODE_SETUP: &str = "Setup";
/// Error code for calls on a session whose sink failed.
pub const CODE_PLAYBACK_FAULT: &str = "PlaybackFault";
/// Error code for malformed arguments.
pub const CODE_INVALID_ARGUMENTS: &str = "InvalidArguments";
/// Error code for a panic caught while handling a call.
pub const CODE_INTERNAL_FAULT: &str = "internalFault";

#[derive(Deserialize)]
struct SetLogLevelArgs {
    log_level: String,
}

#[derive(Deserialize)]
struct SetupArgs {
    sample_rate: i64,
    num_channels: i64,
}

#[derive(Deserialize)]
struct FeedArgs {
    buffer: Vec<u8>,
}

#[derive(Deserialize)]
struct SetFeedThresholdArgs {
    feed_threshold: serde_json::Number,
}

/// The feeder plugin as seen by a host: one engine plus the plugin's log verbosity.
pub struct FeedPlugin {
    engine: PlaybackEngine,
    log_level: LogLevel,
}

impl FeedPlugin {
    pub fn new(factory: Arc<dyn SinkFactory>, config: FeederConfig, events: Sender<FeederEvent>) -> Self {
        Self {
            engine: PlaybackEngine::new(factory, config, events),
            log_level: LogLevel::default(),
        }
    }

    pub fn engine(&self) -> &PlaybackEngine {
        &self.engine
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Handle one call. Never panics: a panic during dispatch becomes an `internalFault` reply.
    pub fn handle(&mut self, call: &MethodCall) -> MethodResponse {
        match catch_unwind(AssertUnwindSafe(|| self.dispatch(call))) {
            Ok(response) => response,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(method = %call.method, "panic while handling call: {message}");
                let backtrace = std::backtrace::Backtrace::force_capture();
                MethodResponse::Error(
                    MethodError::new(CODE_INTERNAL_FAULT, message).with_details(backtrace.to_string()),
                )
            }
        }
    }

    fn dispatch(&mut self, call: &MethodCall) -> MethodResponse {
        if self.log_level >= LogLevel::Verbose {
            tracing::debug!(method = %call.method, "method call");
        }
        let result = match call.method.as_str() {
            "setLogLevel" => self.set_log_level(&call.arguments),
            "setup" => self.setup(&call.arguments),
            "feed" => self.feed(&call.arguments),
            "start" => self.engine.start().map_err(engine_error),
            "stop" => self.engine.stop().map_err(engine_error),
            "setFeedThreshold" => self.set_feed_threshold(&call.arguments),
            "release" => {
                self.engine.release();
                Ok(())
            }
            _ => return MethodResponse::NotImplemented,
        };
        match result {
            Ok(()) => MethodResponse::ok(),
            Err(err) => {
                if self.log_level >= LogLevel::Error {
                    tracing::error!(method = %call.method, code = %err.code, "{}", err.message);
                }
                MethodResponse::Error(err)
            }
        }
    }

    fn set_log_level(&mut self, arguments: &Value) -> Result<(), MethodError> {
        let args: SetLogLevelArgs = parse_args(arguments)?;
        self.log_level = args
            .log_level
            .parse()
            .map_err(|e: String| MethodError::new(CODE_INVALID_ARGUMENTS, e))?;
        Ok(())
    }

    fn setup(&mut self, arguments: &Value) -> Result<(), MethodError> {
        let args: SetupArgs = parse_args(arguments)?;
        let (sample_rate, channels) = match stream_format(&args) {
            Ok(format) => format,
            Err(err) => {
                // Same outcome as an engine-side rejection: no session survives a failed setup.
                self.engine.release();
                return Err(setup_error(err));
            }
        };
        self.engine
            .setup(sample_rate, channels)
            .map_err(setup_error)?;
        if self.log_level >= LogLevel::Standard {
            tracing::info!(sample_rate, channels, "setup complete");
        }
        Ok(())
    }

    fn feed(&mut self, arguments: &Value) -> Result<(), MethodError> {
        if !self.engine.is_configured() {
            return Err(engine_error(EngineError::NotConfigured));
        }
        let args: FeedArgs = parse_args(arguments)?;
        if self.log_level >= LogLevel::Verbose {
            tracing::trace!(bytes = args.buffer.len(), "feed");
        }
        self.engine.feed(args.buffer).map_err(engine_error)
    }

    fn set_feed_threshold(&mut self, arguments: &Value) -> Result<(), MethodError> {
        let args: SetFeedThresholdArgs = parse_args(arguments)?;
        let frames = threshold_frames(&args.feed_threshold);
        self.engine.set_feed_threshold(frames);
        if self.log_level >= LogLevel::Standard {
            tracing::info!(frames, "feed threshold set");
        }
        Ok(())
    }
}

impl Drop for FeedPlugin {
    fn drop(&mut self) {
        self.engine.release();
    }
}

/// Narrow the wire integers, keeping the caller's value in the error.
fn stream_format(args: &SetupArgs) -> Result<(u32, u16), SetupError> {
    let sample_rate =
        u32::try_from(args.sample_rate).map_err(|_| SetupError::InvalidSampleRate(args.sample_rate))?;
    let channels =
        u16::try_from(args.num_channels).map_err(|_| SetupError::InvalidChannels(args.num_channels))?;
    Ok((sample_rate, channels))
}

fn parse_args<T: DeserializeOwned>(arguments: &Value) -> Result<T, MethodError> {
    T::deserialize(arguments).map_err(|e| MethodError::new(CODE_INVALID_ARGUMENTS, e.to_string()))
}

/// Any JSON number is accepted; negatives clamp to zero and fractions truncate.
fn threshold_frames(n: &serde_json::Number) -> u64 {
    if let Some(v) = n.as_u64() {
        v
    } else if n.as_i64().is_some() {
        0
    } else {
        n.as_f64().map(|f| f.max(0.0) as u64).unwrap_or(0)
    }
}

fn setup_error(err: SetupError) -> MethodError {
    let error = MethodError::new(CODE_AUDIO_TRACK, err.to_string());
    match std::error::Error::source(&err) {
        Some(source) => error.with_details(source.to_string()),
        None => error,
    }
}

fn engine_error(err: EngineError) -> MethodError {
    let code = match &err {
        EngineError::NotConfigured => CODE_SETUP,
        EngineError::Faulted(_) => CODE_PLAYBACK_FAULT,
        EngineError::PartialFrame { .. } => CODE_INVALID_ARGUMENTS,
        EngineError::Sink(_) => CODE_AUDIO_TRACK,
    };
    MethodError::new(code, err.to_string())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;
    use pcm_player::engine::EngineState;
    use pcm_player::error::SinkError;
    use pcm_player::memory::{MemorySinkFactory, MemorySinkOptions, MemorySinkProbe};
    use pcm_player::sink::{AudioSink, SinkConfig};
    use serde_json::json;
    use std::time::Duration;

    fn plugin_with(options: MemorySinkOptions) -> (FeedPlugin, MemorySinkProbe, Receiver<FeederEvent>) {
        let factory = MemorySinkFactory::new(options);
        let probe = factory.probe();
        let (tx, rx) = crossbeam_channel::unbounded();
        (FeedPlugin::new(Arc::new(factory), FeederConfig::default(), tx), probe, rx)
    }

    fn plugin() -> (FeedPlugin, MemorySinkProbe, Receiver<FeederEvent>) {
        plugin_with(MemorySinkOptions::default())
    }

    fn setup_call(rate: i64, channels: i64) -> MethodCall {
        MethodCall::new("setup", json!({ "sample_rate": rate, "num_channels": channels }))
    }

    #[test]
    fn unknown_method_is_not_implemented() {
        let (mut plugin, _probe, _rx) = plugin();
        assert_eq!(
            plugin.handle(&MethodCall::bare("getPlatformVersion")),
            MethodResponse::NotImplemented
        );
    }

    #[test]
    fn set_log_level_succeeds() {
        let (mut plugin, _probe, _rx) = plugin();
        let response = plugin.handle(&MethodCall::new("setLogLevel", json!({ "log_level": "error" })));
        assert_eq!(response, MethodResponse::ok());
        assert_eq!(plugin.log_level(), LogLevel::Error);

        let response = plugin.handle(&MethodCall::new("setLogLevel", json!({ "log_level": "shout" })));
        assert_eq!(response.error().map(|e| e.code.as_str()), Some(CODE_INVALID_ARGUMENTS));
    }

    #[test]
    fn feed_before_setup_reports_setup_error() {
        let (mut plugin, _probe, _rx) = plugin();
        let response = plugin.handle(&MethodCall::new("feed", json!({ "buffer": [0, 0] })));
        let err = response.error().unwrap();
        assert_eq!(err.code, CODE_SETUP);
        assert_eq!(err.message, "must call setup first");
    }

    #[test]
    fn setup_then_feed_plays_bytes() {
        let (mut plugin, probe, rx) = plugin();
        assert!(plugin.handle(&setup_call(16_000, 1)).is_success());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());

        let response = plugin.handle(&MethodCall::new("feed", json!({ "buffer": [1, 2, 3, 4] })));
        assert!(response.is_success());
        assert!(probe.wait_for_bytes(4, Duration::from_secs(5)));
        assert_eq!(probe.written(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn invalid_channel_count_is_audio_track_error() {
        let (mut plugin, probe, _rx) = plugin();
        let err = plugin.handle(&setup_call(16_000, 6)).error().cloned().unwrap();
        assert_eq!(err.code, CODE_AUDIO_TRACK);
        assert_eq!(plugin.engine().state(), EngineState::Uninitialized);
        assert!(probe.events().is_empty());

        let err = plugin.handle(&setup_call(-1, 1)).error().cloned().unwrap();
        assert_eq!(err.code, CODE_AUDIO_TRACK);
    }

    #[test]
    fn out_of_range_format_names_the_sent_value() {
        let (mut plugin, probe, _rx) = plugin();
        plugin.handle(&setup_call(16_000, 1));

        let err = plugin.handle(&setup_call(-8000, 1)).error().cloned().unwrap();
        assert_eq!(err.code, CODE_AUDIO_TRACK);
        assert!(err.message.contains("-8000"), "{}", err.message);
        assert!(probe.is_released(1));
        assert!(!plugin.engine().is_configured());

        let err = plugin.handle(&setup_call(16_000, 70_000)).error().cloned().unwrap();
        assert!(err.message.contains("70000"), "{}", err.message);
    }

    #[test]
    fn partial_frame_feed_is_invalid_arguments() {
        let (mut plugin, probe, _rx) = plugin();
        plugin.handle(&setup_call(16_000, 2));
        let response = plugin.handle(&MethodCall::new("feed", json!({ "buffer": [0, 0, 0, 0, 0, 0] })));
        assert_eq!(response.error().map(|e| e.code.as_str()), Some(CODE_INVALID_ARGUMENTS));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(probe.write_count(), 0);
    }

    #[test]
    fn buffer_size_failure_carries_message_and_source() {
        let (mut plugin, _probe, _rx) = plugin_with(MemorySinkOptions {
            fail_min_buffer: true,
            ..MemorySinkOptions::default()
        });
        let err = plugin.handle(&setup_call(16_000, 1)).error().cloned().unwrap();
        assert_eq!(err.code, CODE_AUDIO_TRACK);
        assert_eq!(err.message, "Invalid buffer size.");
        assert!(err.details.unwrap().contains("16000"));
    }

    #[test]
    fn malformed_arguments_are_rejected() {
        let (mut plugin, _probe, _rx) = plugin();
        let response = plugin.handle(&MethodCall::new("setup", json!({ "sample_rate": "fast" })));
        assert_eq!(response.error().map(|e| e.code.as_str()), Some(CODE_INVALID_ARGUMENTS));
        assert!(!plugin.engine().is_configured());
    }

    #[test]
    fn feed_threshold_accepts_any_number() {
        let (mut plugin, _probe, _rx) = plugin();
        let call = |v: Value| MethodCall::new("setFeedThreshold", json!({ "feed_threshold": v }));

        assert!(plugin.handle(&call(json!(1200))).is_success());
        assert_eq!(plugin.engine().feed_threshold(), 1200);
        assert!(plugin.handle(&call(json!(-5))).is_success());
        assert_eq!(plugin.engine().feed_threshold(), 0);
        assert!(plugin.handle(&call(json!(99.7))).is_success());
        assert_eq!(plugin.engine().feed_threshold(), 99);
    }

    #[test]
    fn start_stop_release_reply_true() {
        let (mut plugin, probe, _rx) = plugin();
        for method in ["start", "stop", "release"] {
            assert_eq!(plugin.handle(&MethodCall::bare(method)), MethodResponse::ok());
        }
        plugin.handle(&setup_call(16_000, 2));
        assert_eq!(plugin.handle(&MethodCall::bare("stop")), MethodResponse::ok());
        assert_eq!(plugin.engine().state(), EngineState::Paused);
        assert_eq!(plugin.handle(&MethodCall::bare("start")), MethodResponse::ok());
        assert_eq!(plugin.handle(&MethodCall::bare("release")), MethodResponse::ok());
        assert!(probe.is_released(1));
    }

    #[test]
    fn write_failure_reported_once_then_feed_fails() {
        let (mut plugin, _probe, rx) = plugin_with(MemorySinkOptions {
            fail_write_after: Some(0),
            ..MemorySinkOptions::default()
        });
        plugin.handle(&setup_call(16_000, 1));
        plugin.handle(&MethodCall::new("feed", json!({ "buffer": vec![0u8; 800] })));

        let mut faults = 0;
        while let Ok(event) = rx.recv_timeout(Duration::from_millis(300)) {
            if matches!(event, FeederEvent::PlaybackFault { .. }) {
                faults += 1;
            }
        }
        assert_eq!(faults, 1);
        let response = plugin.handle(&MethodCall::new("feed", json!({ "buffer": [0, 0] })));
        assert_eq!(response.error().map(|e| e.code.as_str()), Some(CODE_PLAYBACK_FAULT));
    }

    #[test]
    fn dropping_plugin_releases_sink() {
        let (mut plugin, probe, _rx) = plugin();
        plugin.handle(&setup_call(44_100, 2));
        drop(plugin);
        assert!(probe.is_released(1));
    }

    struct PanickingFactory;

    impl SinkFactory for PanickingFactory {
        fn min_buffer_size(&self, _config: &SinkConfig) -> Result<usize, SinkError> {
            panic!("device driver exploded");
        }

        fn open(&self, _config: &SinkConfig, _buffer_bytes: usize) -> Result<Arc<dyn AudioSink>, SinkError> {
            Err(SinkError::Released)
        }
    }

    #[test]
    fn panic_during_dispatch_becomes_internal_fault() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut plugin = FeedPlugin::new(Arc::new(PanickingFactory), FeederConfig::default(), tx);
        let err = plugin.handle(&setup_call(16_000, 1)).error().cloned().unwrap();
        assert_eq!(err.code, CODE_INTERNAL_FAULT);
        assert_eq!(err.message, "device driver exploded");
        assert!(err.details.is_some());

        // The plugin keeps answering afterwards.
        assert_eq!(
            plugin.handle(&MethodCall::bare("release")),
            MethodResponse::ok()
        );
    }
}
