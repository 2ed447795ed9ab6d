//! Live protocol message types
//!
//! JSON text frames exchanged with the multimodal live service.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://…/BidiGenerateContent?key=<credential>`
//! 2. Send `{"setup": SessionConfig}`
//! 3. Receive `{"setupComplete": {}}`
//! 4. Send user turns via `clientContent`, stream microphone audio via `realtimeInput`
//! 5. Receive `serverContent` fragments (text and inline PCM16 audio) until `turnComplete`
//! 6. Answer `toolCall` requests with `toolResponse`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProtocolError;

/// Live API endpoint (the credential is appended as `?key=`)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Model used when none is configured
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

/// Build the connection URL carrying the credential as a query parameter
pub fn connection_url(base: &str, api_key: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("key", api_key)
        .finish();
    format!("{}?{}", base, query)
}

// ============================================================================
// Session setup
// ============================================================================

/// Setup payload, immutable for the lifetime of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Model resource name, e.g. `models/gemini-2.0-flash-exp`
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,

    /// Tool descriptors, passed through as-is (e.g. `{"googleSearch": {}}`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            generation_config: Some(GenerationConfig::default()),
            system_instruction: Some(SystemInstruction::from_text(
                "You are a helpful voice assistant. Keep your responses concise and \
                 conversational. Users will talk to you using their voice, and you should \
                 respond in a way that works well for voice interaction.",
            )),
            tools: vec![
                serde_json::json!({ "googleSearch": {} }),
                serde_json::json!({ "codeExecution": {} }),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            response_modalities: vec![ResponseModality::Audio],
            speech_config: Some(SpeechConfig::prebuilt_voice("Aoede")),
            temperature: Some(0.4),
            max_output_tokens: Some(1024),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Text,
    Audio,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

impl SpeechConfig {
    pub fn prebuilt_voice(name: &str) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: name.to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInstruction {
    pub parts: Vec<Part>,
}

impl SystemInstruction {
    pub fn from_text(text: &str) -> Self {
        Self {
            parts: vec![Part::text(text)],
        }
    }
}

// ============================================================================
// Content parts
// ============================================================================

/// One encoded media frame (audio or other media), base64 payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    /// Base64-encoded payload
    pub data: String,
}

impl MediaChunk {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Playable audio is anything whose mime type starts with `audio/`
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

/// A content part; unknown part shapes are carried through untouched
///
/// Only a bare `{"text"}` or `{"inlineData"}` object becomes a typed part.
/// Anything with extra keys (e.g. `"thought": true`) stays `Other` so no
/// field is lost on the content stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: MediaChunk,
    },
    Other(Value),
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Part::from_value(Value::deserialize(deserializer)?))
    }
}

impl Part {
    fn from_value(value: Value) -> Self {
        let Some(obj) = value.as_object().filter(|obj| obj.len() == 1) else {
            return Part::Other(value);
        };

        if let Some(Value::String(text)) = obj.get("text") {
            return Part::text(text.clone());
        }
        if let Some(inline) = obj.get("inlineData") {
            if let Ok(chunk) = serde_json::from_value::<MediaChunk>(inline.clone()) {
                return Part::inline_data(chunk);
            }
        }
        Part::Other(value)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn inline_data(chunk: MediaChunk) -> Self {
        Part::InlineData { inline_data: chunk }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Inline payload if this part carries playable audio
    pub fn as_audio(&self) -> Option<&MediaChunk> {
        match self {
            Part::InlineData { inline_data } if inline_data.is_audio() => Some(inline_data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

// ============================================================================
// Client Messages (sent TO the service)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

/// Messages sent from client to the live service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Session setup, sent once right after the socket opens
    Setup(SessionConfig),

    /// A complete user turn
    ClientContent(ClientContent),

    /// Streamed media (microphone audio)
    RealtimeInput(RealtimeInput),

    /// Reply to a tool call; the payload is opaque to the client
    ToolResponse(Value),
}

impl ClientMessage {
    /// Wrap user parts into a complete turn
    pub fn user_turn(parts: Vec<Part>) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Content {
                role: "user".to_string(),
                parts,
            }],
            turn_complete: true,
        })
    }

    pub fn realtime_input(media_chunks: Vec<MediaChunk>) -> Self {
        Self::RealtimeInput(RealtimeInput { media_chunks })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }
}

// ============================================================================
// Server Messages (received FROM the service)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,

    #[serde(default)]
    pub turn_complete: Option<bool>,

    /// Set by the service when it cut its own response short
    #[serde(default)]
    pub interrupted: Option<bool>,
}

impl ServerContent {
    pub fn parts(&self) -> &[Part] {
        self.model_turn
            .as_ref()
            .map(|turn| turn.parts.as_slice())
            .unwrap_or(&[])
    }

    /// Audio parts in arrival order
    pub fn audio_chunks(&self) -> impl Iterator<Item = &MediaChunk> {
        self.parts().iter().filter_map(Part::as_audio)
    }

    /// Concatenated text parts, if any
    pub fn text(&self) -> Option<String> {
        let text: String = self.parts().iter().filter_map(Part::as_text).collect();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn is_turn_complete(&self) -> bool {
        self.turn_complete == Some(true)
    }
}

/// Messages received from the live service
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Setup acknowledged; the session is usable
    SetupComplete,

    /// A response fragment
    ServerContent(ServerContent),

    /// Tool invocation request, passed through unparsed
    ToolCall(Value),

    /// Catch-all for message types we don't handle
    Unknown(Value),
}

impl ServerMessage {
    /// Parse one inbound frame
    ///
    /// Anything that is not a JSON object, or whose `serverContent` does not
    /// match the expected shape, is a `MalformedMessage`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;

        let obj = value.as_object().ok_or_else(|| {
            ProtocolError::MalformedMessage("frame is not a JSON object".to_string())
        })?;

        if obj.contains_key("setupComplete") {
            return Ok(ServerMessage::SetupComplete);
        }

        if let Some(content) = obj.get("serverContent") {
            let content: ServerContent = serde_json::from_value(content.clone())
                .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
            return Ok(ServerMessage::ServerContent(content));
        }

        if let Some(call) = obj.get("toolCall") {
            return Ok(ServerMessage::ToolCall(call.clone()));
        }

        Ok(ServerMessage::Unknown(value))
    }

    pub fn server_content(&self) -> Option<&ServerContent> {
        match self {
            ServerMessage::ServerContent(content) => Some(content),
            _ => None,
        }
    }
}
