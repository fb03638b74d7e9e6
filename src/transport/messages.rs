//! # Remote Session Message Contract
//!
//! Wire types for the bidirectional audio session. The remote service is an
//! opaque collaborator: this module only describes what goes over the socket.
//!
//! ## Client → Server:
//! - `{"setup": {...}}` once, right after the socket opens
//! - `{"realtimeInput": {"mediaChunks": [{"data": "<base64 pcm16>", "mimeType": "audio/pcm;rate=16000"}]}}`
//!   for every captured frame
//!
//! ## Server → Client:
//! - `{"serverContent": {"interrupted": true}}` (barge-in)
//! - `{"serverContent": {"modelTurn": {"parts": [{"inlineData": {"data": "..."}}]}}}`
//! - anything else (`setupComplete`, `turnComplete`, ...) is tolerated and ignored

use serde::{Deserialize, Serialize};

/// Voices the remote service is known to accept.
pub const VALID_VOICES: [&str; 5] = ["Zephyr", "Puck", "Charon", "Kore", "Fenrir"];

/// Voice used when the requested one is not in the allow-list.
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Validate a requested voice, falling back to [`DEFAULT_VOICE`].
pub fn resolve_voice(requested: &str) -> &'static str {
    VALID_VOICES
        .iter()
        .copied()
        .find(|voice| *voice == requested)
        .unwrap_or(DEFAULT_VOICE)
}

/// A base64 media payload with its declared format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub data: String,
    pub mime_type: String,
}

/// One outbound audio message: `{ media: { data, mimeType } }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeInput {
    pub media: MediaBlob,
}

/// Requested response modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
}

/// Everything the remote session needs to know at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub model: String,
    pub response_modality: Modality,
    /// Already validated against [`VALID_VOICES`].
    pub voice_name: String,
    pub system_instruction: String,
}

impl ConnectRequest {
    pub fn new(model: &str, requested_voice: &str, system_instruction: &str) -> Self {
        Self {
            model: model.to_string(),
            response_modality: Modality::Audio,
            voice_name: resolve_voice(requested_voice).to_string(),
            system_instruction: system_instruction.to_string(),
        }
    }
}

/// Messages written to the socket.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupMessage),
    RealtimeInput(RealtimeInputWire),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputWire {
    pub media_chunks: Vec<MediaBlob>,
}

impl From<&ConnectRequest> for SetupMessage {
    fn from(request: &ConnectRequest) -> Self {
        // The service expects fully qualified model names
        let model = if request.model.starts_with("models/") {
            request.model.clone()
        } else {
            format!("models/{}", request.model)
        };

        let system_instruction = (!request.system_instruction.is_empty()).then(|| Content {
            parts: vec![TextPart {
                text: request.system_instruction.clone(),
            }],
        });

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![request.response_modality],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: request.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction,
        }
    }
}

impl From<RealtimeInput> for ClientMessage {
    fn from(input: RealtimeInput) -> Self {
        ClientMessage::RealtimeInput(RealtimeInputWire {
            media_chunks: vec![input.media],
        })
    }
}

/// Messages read from the socket. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ServerMessage {
    /// Barge-in signal: flush everything that is queued or playing.
    pub fn is_interrupted(&self) -> bool {
        self.server_content.as_ref().is_some_and(|content| content.interrupted)
    }

    /// Base64 audio payloads carried by this message, in delivery order.
    pub fn audio_chunks(&self) -> impl Iterator<Item = &str> {
        self.server_content
            .iter()
            .filter_map(|content| content.model_turn.as_ref())
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .map(|inline| inline.data.as_str())
            .filter(|data| !data.is_empty())
    }
}

#[cfg(test)]
impl ServerMessage {
    pub fn interrupted() -> Self {
        Self {
            server_content: Some(ServerContent {
                interrupted: true,
                ..ServerContent::default()
            }),
            ..Self::default()
        }
    }

    pub fn audio(chunks: Vec<String>) -> Self {
        let parts = chunks
            .into_iter()
            .map(|data| Part {
                inline_data: Some(InlineData { data, mime_type: None }),
                text: None,
            })
            .collect();

        Self {
            server_content: Some(ServerContent {
                model_turn: Some(ModelTurn { parts }),
                ..ServerContent::default()
            }),
            ..Self::default()
        }
    }
}
