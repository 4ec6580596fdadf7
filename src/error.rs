use thiserror::Error;

use crate::config::ConfigError;
use crate::listener::EngineError;
use crate::transport::protocol::ProtocolError;

pub type Result<T> = std::result::Result<T, VoiceError>;

#[derive(Error, Debug)]
pub enum VoiceError {
    /// A listener could not acquire its recognition engine. Retried on the next natural trigger.
    #[error("Engine start failure: {0}")]
    EngineStart(String),

    /// Microphone permission or hardware error.
    #[error("Device acquisition failure: {0}")]
    DeviceAcquisition(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport exhausted after {attempts} reconnect attempts")]
    TransportExhausted { attempts: u32 },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Runtime closed: {0}")]
    Closed(String),
}

impl From<EngineError> for VoiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::PermissionDenied(reason) => VoiceError::DeviceAcquisition(reason),
            other => VoiceError::EngineStart(other.to_string()),
        }
    }
}
