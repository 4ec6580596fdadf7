//! JSON messages exchanged with the `/ws/voice` stream server.

use crate::language::Language;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed server message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unexpected binary frame of {0} bytes")]
    UnexpectedBinary(usize),
}

/// Client → server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start {
        session_id: String,
        language: Language,
    },
    Audio {
        /// Base64 little-endian 16-bit PCM
        data: String,
    },
    Stop,
    ChangeLanguage {
        language: Language,
    },
}

/// Server → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Started {
        session_id: String,
        #[serde(default)]
        language: Option<String>,
    },
    Transcript {
        text: String,
        #[serde(default)]
        is_final: bool,
    },
    Response(AgentReply),
    Error {
        message: String,
    },
    Stopped,
}

/// Agent reply payload carried by a `response` message
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentReply {
    pub text: String,
    /// Base64 encoded speech, when the server synthesised it
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub requires_camera: bool,
    #[serde(default)]
    pub requires_images: bool,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
