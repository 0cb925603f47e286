//! JSON message envelope exchanged with the live conversation service.
//!
//! Only the audio payloads and the interruption flag are interpreted; model,
//! voice and system instruction are passed through as given.

use crate::channel::{InboundAudio, OutboundChunk, ServerMessage};
use crate::codec::{self, DEFAULT_INBOUND_RATE};
use crate::config::SessionConfig;
use crate::error::VoiceResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl ClientMessage {
    pub fn setup(session: &SessionConfig) -> Self {
        let model = if session.model.starts_with("models/") {
            session.model.clone()
        } else {
            format!("models/{}", session.model)
        };
        let system_instruction = if session.system_instruction.trim().is_empty() {
            None
        } else {
            Some(Content {
                parts: vec![TextPart {
                    text: session.system_instruction.clone(),
                }],
            })
        };

        ClientMessage::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: session.voice.clone(),
                        },
                    },
                },
            },
            system_instruction,
        })
    }

    pub fn audio(chunk: &OutboundChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: codec::pcm_mime_type(chunk.sample_rate),
                data: codec::encode_base64(&chunk.pcm),
            }],
        })
    }

    pub fn to_json(&self) -> VoiceResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerEnvelope {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

/// Everything one server frame means to the engine, in delivery order.
#[derive(Debug, Default, PartialEq)]
pub struct ServerFrame {
    pub setup_complete: bool,
    pub messages: Vec<ServerMessage>,
}

/// Parse one server frame. Audio parts come first, then the interruption flag,
/// then turn completion.
pub fn parse_server_frame(text: &str) -> VoiceResult<ServerFrame> {
    let envelope: ServerEnvelope = serde_json::from_str(text)?;
    let mut frame = ServerFrame {
        setup_complete: envelope.setup_complete.is_some(),
        messages: Vec::new(),
    };

    if let Some(content) = envelope.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    frame.messages.push(ServerMessage::Audio(InboundAudio {
                        sample_rate: codec::parse_pcm_rate(&inline.mime_type)
                            .unwrap_or(DEFAULT_INBOUND_RATE),
                        channels: 1,
                        data: inline.data,
                    }));
                }
            }
        }
        if content.interrupted {
            frame.messages.push(ServerMessage::Interrupted);
        }
        if content.turn_complete {
            frame.messages.push(ServerMessage::TurnComplete);
        }
    }

    if !frame.setup_complete && frame.messages.is_empty() {
        frame.messages.push(ServerMessage::Other);
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn setup_carries_configuration_unchanged() {
        let session = SessionConfig::default()
            .with_voice("Aria")
            .with_system_instruction("Be brief.");
        let text = ClientMessage::setup(&session).to_json().unwrap();
        let json: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(
            json["setup"]["model"],
            "models/gemini-2.5-flash-preview-native-audio-dialog"
        );
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Aria"
        );
        assert_eq!(json["setup"]["systemInstruction"]["parts"][0]["text"], "Be brief.");
    }

    #[test]
    fn audio_chunk_is_base64_with_rate() {
        let chunk = OutboundChunk {
            pcm: vec![0x00, 0x40],
            sample_rate: 16_000,
        };
        let text = ClientMessage::audio(&chunk).to_json().unwrap();
        let json: Value = serde_json::from_str(&text).unwrap();
        let media = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(media["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(media["data"], "AEA=");
    }

    #[test]
    fn audio_then_interruption_in_order() {
        let text = r#"{
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                    {"text": "ignored"},
                    {"inlineData": {"mimeType": "audio/pcm", "data": "AQA="}}
                ]},
                "interrupted": true
            }
        }"#;
        let frame = parse_server_frame(text).unwrap();
        assert!(!frame.setup_complete);
        assert_eq!(frame.messages.len(), 3);
        assert!(matches!(&frame.messages[0], ServerMessage::Audio(a) if a.sample_rate == 24_000));
        assert!(matches!(&frame.messages[1], ServerMessage::Audio(a) if a.data == "AQA="));
        assert_eq!(frame.messages[2], ServerMessage::Interrupted);
    }

    #[test]
    fn setup_complete_is_recognised() {
        let frame = parse_server_frame(r#"{"setupComplete": {}}"#).unwrap();
        assert!(frame.setup_complete);
        assert!(frame.messages.is_empty());
    }

    #[test]
    fn unknown_frames_are_other() {
        let frame = parse_server_frame(r#"{"usageMetadata": {"totalTokenCount": 3}}"#).unwrap();
        assert_eq!(frame.messages, vec![ServerMessage::Other]);
    }

    #[test]
    fn turn_complete_is_reported() {
        let frame = parse_server_frame(r#"{"serverContent": {"turnComplete": true}}"#).unwrap();
        assert_eq!(frame.messages, vec![ServerMessage::TurnComplete]);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_server_frame("{not json").is_err());
    }
}
