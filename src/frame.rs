// Wire frames exchanged with the relay
//
// Outbound:  {"type":"message","message":{...,"encrypted":true},"isSync":true}
// Inbound:   {"type":"message","message":{...}}
//
// Message text travels base64-obscured. This is an encoding, not encryption.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Attachment, Message};

pub const FRAME_TYPE_MESSAGE: &str = "message";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 text: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Decoded text is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Message frame without a message body")]
    MissingMessage,
}

/// Message body as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub text: String,
    pub sender: String,
    #[serde(default)]
    pub avatar: String,
    pub timestamp: i64,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Serialize)]
struct OutboundFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    message: WireMessage,
    #[serde(rename = "isSync", skip_serializing_if = "Option::is_none")]
    is_sync: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<WireMessage>,
}

pub fn obscure(text: &str) -> String {
    BASE64.encode(text.as_bytes())
}

pub fn reveal(text: &str) -> Result<String, FrameError> {
    let bytes = BASE64.decode(text)?;
    Ok(String::from_utf8(bytes)?)
}

/// Serialize a message into an outbound frame. `sync` marks frames sent by a
/// queue flush.
pub fn encode_message(message: &Message, sync: bool) -> Result<String, FrameError> {
    let frame = OutboundFrame {
        kind: FRAME_TYPE_MESSAGE,
        message: WireMessage {
            id: message.id.clone(),
            text: obscure(&message.text),
            sender: message.sender.clone(),
            avatar: message.avatar.clone(),
            timestamp: message.timestamp_ms,
            encrypted: true,
            attachment: message.attachment.clone(),
        },
        is_sync: if sync { Some(true) } else { None },
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Parse an inbound frame. Frames of other types yield `Ok(None)`.
pub fn decode_message(raw: &str) -> Result<Option<Message>, FrameError> {
    let frame: InboundFrame = serde_json::from_str(raw)?;
    if frame.kind != FRAME_TYPE_MESSAGE {
        return Ok(None);
    }
    let wire = frame.message.ok_or(FrameError::MissingMessage)?;
    let text = if wire.encrypted {
        reveal(&wire.text)?
    } else {
        wire.text
    };
    Ok(Some(Message {
        id: wire.id,
        text,
        sender: wire.sender,
        avatar: wire.avatar,
        timestamp_ms: wire.timestamp,
        attachment: wire.attachment,
    }))
}
