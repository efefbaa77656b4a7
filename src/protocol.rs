//! Wire protocol spoken with the agent
//!
//! Every frame is a JSON object with a `type` tag and an optional `content`
//! string. Audio content is base64 PCM; everything else is plain text.

use crate::error::{KoraError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A protocol message, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Client → agent: one encoded microphone chunk
    AudioInput { content: String },
    /// Client → agent: the user finished talking
    EndOfSpeech {},
    /// Agent → client: spoken or answer text
    Text { content: String },
    /// Agent → client: recognized user speech
    Transcript { content: String },
    /// Agent → client: one encoded speech segment
    Audio { content: String },
    /// Agent → client: the agent finished responding
    EndOfTurn {},
}

const KNOWN_TYPES: &[&str] = &[
    "audio_input",
    "end_of_speech",
    "text",
    "transcript",
    "audio",
    "end_of_turn",
];

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::AudioInput { .. } => "audio_input",
            Message::EndOfSpeech {} => "end_of_speech",
            Message::Text { .. } => "text",
            Message::Transcript { .. } => "transcript",
            Message::Audio { .. } => "audio",
            Message::EndOfTurn {} => "end_of_turn",
        }
    }

    /// Whether this variant is only ever sent by the client.
    pub fn is_client_message(&self) -> bool {
        matches!(self, Message::AudioInput { .. } | Message::EndOfSpeech {})
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse one inbound frame.
///
/// Returns `Ok(None)` for well-formed frames with an unknown `type`, so newer
/// agents can add message kinds without breaking older clients.
pub fn parse_inbound(text: &str) -> Result<Option<Message>> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| KoraError::MalformedMessage(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| KoraError::MalformedMessage("missing string `type` field".into()))?;

    if !KNOWN_TYPES.contains(&kind) {
        debug!("Ignoring unknown message type '{}'", kind);
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| KoraError::MalformedMessage(e.to_string()))
}
