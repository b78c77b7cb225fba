//! JSON control messages exchanged over the session WebSocket.
//!
//! Control messages travel as text frames tagged by `type`. Captured speech
//! travels client to server as raw binary frames, which are not modelled here.

use crate::session::context::AudioContext;
use serde::{Deserialize, Serialize};

/// How the server delivers a reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// One `agent` message with the whole reply and its audio.
    Single,
    /// Incremental `agent-stream` deltas and `audio-chunk` messages.
    #[default]
    Stream,
}

impl std::str::FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(ChatMode::Single),
            "stream" => Ok(ChatMode::Stream),
            other => Err(format!("unknown chat mode '{}'", other)),
        }
    }
}

impl std::fmt::Display for ChatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatMode::Single => f.write_str("single"),
            ChatMode::Stream => f.write_str("stream"),
        }
    }
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Session preferences. Absent fields keep their current value.
    Config {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stt_engine: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tts_engine: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_mode: Option<ChatMode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        noise_reduction: Option<bool>,
    },
    AudioContext(AudioContext),
    /// The user started talking over the reply.
    BargeIn,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        conversation_id: String,
    },
    Transcript {
        transcript: String,
    },
    /// Complete reply (single mode). Audio is base64 PCM.
    Agent {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speech_audio: Option<String>,
    },
    AgentStream {
        delta: String,
    },
    AgentStreamComplete,
    /// One synthesized chunk (stream mode), base64 PCM.
    AudioChunk {
        data: String,
    },
    #[serde(rename = "auth_required")]
    AuthRequired {
        message: String,
    },
    Error {
        message: String,
    },
    BargeInAck,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
