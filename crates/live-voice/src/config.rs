//! Layered configuration: built-in defaults < TOML file < `LIVE_VOICE__*` environment.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-preview-native-audio-dialog";
pub const DEFAULT_VOICE: &str = "Orus";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful AI assistant.";
pub const DEFAULT_ENDPOINT: &str = concat!(
    "wss://generativelanguage.googleapis.com/ws/",
    "google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent"
);

/// Prebuilt voices offered by the service.
pub const KNOWN_VOICES: &[&str] = &["Orus", "Aria", "Leo", "Kai"];

/// Per-conversation configuration, passed through to the remote service unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            voice: default_voice(),
            system_instruction: default_system_instruction(),
        }
    }
}

impl SessionConfig {
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    pub fn with_system_instruction(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = text.into();
        self
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if self.model.trim().is_empty() {
            return Err(VoiceError::Config("Model identifier must not be empty".to_string()));
        }
        if self.voice.trim().is_empty() {
            return Err(VoiceError::Config("Voice must not be empty".to_string()));
        }
        if !KNOWN_VOICES.iter().any(|v| v.eq_ignore_ascii_case(&self.voice)) {
            warn!("Voice '{}' is not a known prebuilt voice; passing through", self.voice);
        }
        Ok(())
    }
}

/// Where the remote service lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_endpoint")]
    pub url: String,
    /// Sent as the `key` query parameter.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: default_endpoint(),
            api_key: None,
        }
    }
}

/// Audio I/O parameters. Wire rates are fixed by the service; they are
/// configurable only so simulated devices can use other values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    #[serde(default = "default_input_rate")]
    pub input_sample_rate: u32,
    #[serde(default = "default_output_rate")]
    pub output_sample_rate: u32,
    /// Samples per captured frame.
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    /// How often finished playbacks are swept from the active set.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_sample_rate: default_input_rate(),
            output_sample_rate: default_output_rate(),
            frame_size: default_frame_size(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub audio: AudioSettings,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_voice() -> String {
    DEFAULT_VOICE.to_string()
}

fn default_system_instruction() -> String {
    DEFAULT_SYSTEM_INSTRUCTION.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_input_rate() -> u32 {
    16_000
}

fn default_output_rate() -> u32 {
    24_000
}

fn default_frame_size() -> usize {
    256
}

fn default_sweep_interval_ms() -> u64 {
    20
}

impl LiveConfig {
    /// Load from `live-voice.toml` (or `LIVE_VOICE_CONFIG`) and the environment.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("LIVE_VOICE_CONFIG")
            .unwrap_or_else(|_| "live-voice.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load with an explicit file. A missing file is not an error.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder()
            .set_default("session.model", DEFAULT_MODEL)?
            .set_default("session.voice", DEFAULT_VOICE)?
            .set_default("session.system_instruction", DEFAULT_SYSTEM_INSTRUCTION)?
            .set_default("endpoint.url", DEFAULT_ENDPOINT)?
            .set_default("audio.input_sample_rate", default_input_rate() as i64)?
            .set_default("audio.output_sample_rate", default_output_rate() as i64)?
            .set_default("audio.frame_size", default_frame_size() as i64)?
            .set_default("audio.sweep_interval_ms", default_sweep_interval_ms() as i64)?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("LIVE_VOICE").separator("__"))
            .build()?;

        let loaded: LiveConfig = built.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        self.session.validate()?;
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(VoiceError::Config("Sample rates must be non-zero".to_string()));
        }
        if self.audio.frame_size == 0 {
            return Err(VoiceError::Config("Frame size must be non-zero".to_string()));
        }
        if self.audio.sweep_interval_ms == 0 {
            return Err(VoiceError::Config("Sweep interval must be non-zero".to_string()));
        }
        Ok(())
    }
}
