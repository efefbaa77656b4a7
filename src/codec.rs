//! Base64 framing of PCM audio for the JSON protocol

use crate::capture::AudioChunk;
use crate::error::{KoraError, Result};
use crate::protocol::Message;
use base64::engine::general_purpose;
use base64::Engine;

/// Encode a captured chunk as an `audio_input` message.
///
/// Returns `None` for empty chunks; every non-empty chunk yields exactly one
/// message.
pub fn encode_chunk(chunk: &AudioChunk) -> Option<Message> {
    if chunk.pcm.is_empty() {
        return None;
    }
    Some(Message::AudioInput {
        content: general_purpose::STANDARD.encode(&chunk.pcm),
    })
}

/// Decode an inbound `audio` payload into raw bytes for the sink.
pub fn decode_segment(content: &str) -> Result<Vec<u8>> {
    let bytes = general_purpose::STANDARD
        .decode(content.trim())
        .map_err(|e| KoraError::DecodeFailure(format!("invalid base64: {}", e)))?;

    if bytes.is_empty() {
        return Err(KoraError::DecodeFailure("empty audio segment".into()));
    }
    Ok(bytes)
}

/// Check that a decoded segment is whole S16LE samples.
pub fn check_pcm16(bytes: &[u8]) -> Result<()> {
    if bytes.len() % 2 != 0 {
        return Err(KoraError::DecodeFailure(format!(
            "odd byte count {} for 16-bit PCM",
            bytes.len()
        )));
    }
    Ok(())
}

/// S16LE bytes to samples; a trailing odd byte is ignored
pub fn u8_to_i16_slice(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
