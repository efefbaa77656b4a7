//! Error types for the voice session

use tokio_tungstenite::tungstenite::Error as WsError;

/// Error type for session, device and transport operations
#[derive(Debug, thiserror::Error)]
pub enum KoraError {
    /// The user or the OS refused access to the microphone
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// The capture or playback device could not be opened
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// An inbound payload was not a known protocol message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A playback segment could not be decoded
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,
}

impl KoraError {
    /// Errors the user has to act on (shown immediately, block the action).
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            KoraError::PermissionDenied(_) | KoraError::DeviceUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, KoraError>;
