//! Error types for the live voice session engine

use thiserror::Error;

/// Result type alias for voice session operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a live voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    /// The remote channel failed to open or errored while open.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Microphone unavailable, denied, or failed to open.
    #[error("Audio device error: {0}")]
    Device(String),

    /// Malformed or truncated audio payload.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Operation not permitted in the current session state.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers that only care about the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Device,
    Codec,
    Precondition,
    Other,
}

impl VoiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VoiceError::Connection(_) | VoiceError::Config(_) => ErrorKind::Connection,
            VoiceError::Device(_) | VoiceError::AudioStream(_) => ErrorKind::Device,
            VoiceError::Codec(_) => ErrorKind::Codec,
            VoiceError::Precondition(_) => ErrorKind::Precondition,
            VoiceError::Playback(_) | VoiceError::ChannelSend(_) | VoiceError::Io(_) => {
                ErrorKind::Other
            }
        }
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Connection(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Codec(format!("Invalid message envelope: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_recovery_policy() {
        assert_eq!(VoiceError::Connection("x".into()).kind(), ErrorKind::Connection);
        assert_eq!(VoiceError::Config("x".into()).kind(), ErrorKind::Connection);
        assert_eq!(VoiceError::Device("x".into()).kind(), ErrorKind::Device);
        assert_eq!(VoiceError::Codec("x".into()).kind(), ErrorKind::Codec);
        assert_eq!(VoiceError::Precondition("x".into()).kind(), ErrorKind::Precondition);
    }

    #[test]
    fn base64_failure_is_a_codec_error() {
        use base64::Engine;
        let err: VoiceError = base64::engine::general_purpose::STANDARD
            .decode("not base64!!")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Codec);
    }
}
