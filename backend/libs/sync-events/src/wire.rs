/// Control envelopes for the UDP and TCP protocols
use serde::{Deserialize, Serialize};

use crate::ProgressUpdate;

/// Control datagrams of the UDP notification protocol
///
/// Notifications themselves are sent as bare `Notification` objects; this
/// enum only covers the registration handshake and acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UdpMessage {
    /// Client asks to receive notifications
    #[serde(rename = "REGISTER")]
    Register,

    /// Server confirms a registration
    #[serde(rename = "REGISTER_ACK")]
    RegisterAck,

    /// Client acknowledges a notification it received
    #[serde(rename = "ACK")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl UdpMessage {
    pub fn ack(id: impl Into<String>) -> Self {
        UdpMessage::Ack { id: Some(id.into()) }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Lines a client sends to the progress sync server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Heartbeat
    #[serde(rename = "PING")]
    Ping,

    /// Progress report; any client-supplied timestamp is ignored
    #[serde(rename = "PROGRESS")]
    Progress {
        user_id: String,
        manga_id: String,
        chapter: i64,
    },
}

impl ClientMessage {
    pub fn progress(update: &ProgressUpdate) -> Self {
        ClientMessage::Progress {
            user_id: update.user_id.clone(),
            manga_id: update.manga_id.clone(),
            chapter: update.chapter,
        }
    }

    /// Encode as a single newline-terminated frame
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Control lines the progress sync server sends back
///
/// Broadcast and replayed progress events are sent as bare `ProgressUpdate`
/// objects rather than through this enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "PONG")]
    Pong,
}

impl ServerMessage {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
