//! Kora - push-to-talk voice client for conversational agents
//!
//! Streams microphone audio to an agent over a WebSocket, plays the agent's
//! spoken reply back in order, and keeps a running transcript of both sides.

pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod playback;
pub mod protocol;
/// PulseAudio devices (enabled with the "pulse" feature)
#[cfg(feature = "pulse")]
pub mod pulse;
pub mod session;
pub mod transcript;
pub mod transport;
pub mod turn;

pub use config::SessionConfig;
pub use error::{KoraError, Result};
pub use session::{Session, SessionHandle, SessionUpdate, UserCommand};
