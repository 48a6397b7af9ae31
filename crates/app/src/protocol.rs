//! Chat protocol spoken by the sample server and client
//!
//! Every frame carries one JSON document. Clients send [`ChatRequest`]s,
//! the server answers with [`ChatEvent`]s. While two clients are paired the
//! server relays their requests verbatim, so a client may also receive a
//! peer's [`ChatRequest::Say`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatRequest {
    /// Say something to everyone, or to the members of `room`
    Say {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        text: String,
    },
    Join {
        room: String,
    },
    Leave {
        room: String,
    },
    /// Ask to be paired with the next client that asks too
    Pair,
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Message {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// Server announcement (peers coming and going, errors)
    Notice {
        text: String,
        timestamp: DateTime<Utc>,
    },
    Joined {
        room: String,
        members: usize,
    },
    Left {
        room: String,
    },
    /// Parked until another client asks to pair
    Waiting,
    Paired {
        peer: String,
    },
}

impl ChatRequest {
    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl ChatEvent {
    pub fn notice(text: impl Into<String>) -> Self {
        Self::Notice {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn message(from: impl Into<String>, room: Option<String>, text: impl Into<String>) -> Self {
        Self::Message {
            from: from.into(),
            room,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
