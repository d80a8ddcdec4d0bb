use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A chat message as held by the store, the cache and the pending queue.
///
/// Messages are never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sender: String,
    #[serde(default)]
    pub avatar: String,
    /// Milliseconds since the Unix epoch
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

/// Opaque attachment reference carried alongside a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(rename = "dataRef")]
    pub data_ref: String,
}

impl Message {
    pub fn new(id: String, text: &str, sender: &str, avatar: &str, timestamp_ms: i64) -> Self {
        Message {
            id,
            text: text.to_string(),
            sender: sender.to_string(),
            avatar: avatar.to_string(),
            timestamp_ms,
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

/// Generate a message id of the form `msg_{timestamp}_{suffix}`.
///
/// The suffix is nine random base-36 characters. Callers that need a hard
/// uniqueness guarantee re-roll against their own index (see `MessageStore`).
pub fn generate_message_id(timestamp_ms: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("msg_{}_{}", timestamp_ms, suffix)
}

/// Connection state as reported by the connection manager.
/// Exactly one value is active at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Offline,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the messenger for presentation layers
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub offline: bool,
    pub failures: u32,
    pub pending: usize,
    pub messages: usize,
    pub last_sync_ms: Option<i64>,
}
