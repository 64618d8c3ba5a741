use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Callback name used for low-buffer and drained notifications.
pub const ON_FEED_SAMPLES: &str = "OnFeedSamples";
/// Callback name used when the playback thread gives up on a failing sink.
pub const ON_PLAYBACK_FAULT: &str = "OnPlaybackFault";

/// Asynchronous notification raised by the playback thread.
///
/// The playback thread never calls into the host directly; it sends these over a channel
/// and the host's delivery context turns them into callbacks.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeederEvent {
    /// Buffered frames dropped to/below the feed threshold, or the queue drained.
    FeedSamples {
        /// Frames still queued when the event was raised.
        remaining_frames: u64,
    },
    /// A sink write failed; the session stopped playing.
    PlaybackFault {
        /// Human-readable error from the sink.
        message: String,
    },
}

impl FeederEvent {
    /// Convert into the outbound call delivered to the host.
    pub fn into_call(self) -> MethodCall {
        match self {
            FeederEvent::FeedSamples { remaining_frames } => MethodCall::new(
                ON_FEED_SAMPLES,
                serde_json::json!({ "remaining_frames": remaining_frames }),
            ),
            FeederEvent::PlaybackFault { message } => {
                MethodCall::new(ON_PLAYBACK_FAULT, serde_json::json!({ "message": message }))
            }
        }
    }
}

/// Verbosity of the control surface's own logging.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    None,
    Error,
    Standard,
    #[default]
    Verbose,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(LogLevel::None),
            "error" => Ok(LogLevel::Error),
            "standard" => Ok(LogLevel::Standard),
            "verbose" => Ok(LogLevel::Verbose),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// A named call with JSON arguments, in either direction across the method channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }

    /// A call without arguments.
    pub fn bare(method: impl Into<String>) -> Self {
        Self::new(method, Value::Null)
    }
}

/// Error reply: a stable code, a message, and optional diagnostic details.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct MethodError {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
}

impl MethodError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Reply to a [`MethodCall`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum MethodResponse {
    Success(Value),
    Error(MethodError),
    NotImplemented,
}

impl MethodResponse {
    pub fn ok() -> Self {
        MethodResponse::Success(Value::Bool(true))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MethodResponse::Success(_))
    }

    /// Return the error reply, if any.
    pub fn error(&self) -> Option<&MethodError> {
        match self {
            MethodResponse::Error(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_samples_event_becomes_callback() {
        let call = FeederEvent::FeedSamples { remaining_frames: 42 }.into_call();
        assert_eq!(call.method, ON_FEED_SAMPLES);
        assert_eq!(call.arguments["remaining_frames"], 42);
    }

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!("Verbose".parse::<LogLevel>(), Ok(LogLevel::Verbose));
        assert_eq!(" none ".parse::<LogLevel>(), Ok(LogLevel::None));
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Error < LogLevel::Standard);
    }

    #[test]
    fn method_call_without_arguments_deserializes() {
        let call: MethodCall = serde_json::from_str(r#"{"method":"start"}"#).unwrap();
        assert_eq!(call, MethodCall::bare("start"));
    }

    #[test]
    fn method_error_displays_code_and_message() {
        let err = MethodError::new("Setup", "must call setup first").with_details("trace");
        assert_eq!(err.to_string(), "Setup: must call setup first");
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn response_serializes_with_status_tag() {
        let json = serde_json::to_value(MethodResponse::Error(MethodError::new(
            "Setup",
            "must call setup first",
        )))
        .unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["payload"]["code"], "Setup");
    }
}
