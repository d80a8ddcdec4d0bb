// src/transport/mod.rs
//! Transport abstraction for the relay channel.
//!
//! A transport opens, writes to and closes a single bidirectional channel.
//! Everything it observes (open, inbound frames, errors, close) is reported
//! back as a `TransportEvent` on the sink it was built with, tagged with the
//! `ChannelId` passed to `open`. The connection manager uses the tag to
//! discard events from channels it has already given up on.

use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod websocket;

pub use websocket::WsTransport;

/// Identifies one `open` call on a transport
pub type ChannelId = u64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Relay URL is invalid: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Frame error: {0}")]
    Frame(#[from] crate::frame::FrameError),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    Opened,
    Frame(String),
    Error(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub channel: ChannelId,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(channel: ChannelId, kind: TransportEventKind) -> Self {
        TransportEvent { channel, kind }
    }
}

/// Where transports deliver their events
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

pub trait Transport: Send {
    /// Start opening a channel to `url`. Completion is reported through the
    /// event sink; an `Err` here means the attempt never started.
    fn open(&mut self, url: &str, channel: ChannelId) -> TransportResult<()>;

    /// Hand a text frame to the open channel.
    ///
    /// `Ok` means the frame was accepted for writing, not that the relay got
    /// it. A write that fails later surfaces as an `Error` event and the frame
    /// is not retried.
    fn send(&mut self, frame: &str) -> TransportResult<()>;

    /// Close the channel if one is open. Never fails.
    fn close(&mut self);
}

/// Resolved relay endpoint plus the security context of the hosting origin
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    url: String,
    secure_context: bool,
}

impl Endpoint {
    /// Resolve the relay URL for `origin`.
    ///
    /// Without an explicit `relay_url`, the scheme follows the origin
    /// (`https` -> `wss`, `http` -> `ws`) and `path` is appended to its host.
    pub fn resolve(origin: &str, relay_url: Option<&str>, path: &str) -> TransportResult<Self> {
        let origin = Url::parse(origin)
            .map_err(|e| TransportError::InvalidUrl(format!("origin '{}': {}", origin, e)))?;
        let secure_context = match origin.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported origin scheme '{}'",
                    other
                )))
            }
        };

        let url = match relay_url {
            Some(explicit) => {
                let parsed = Url::parse(explicit)
                    .map_err(|e| TransportError::InvalidUrl(format!("relay '{}': {}", explicit, e)))?;
                if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                    return Err(TransportError::InvalidUrl(format!(
                        "relay scheme must be ws or wss, got '{}'",
                        parsed.scheme()
                    )));
                }
                parsed.to_string()
            }
            None => {
                let host = origin
                    .host_str()
                    .ok_or_else(|| TransportError::InvalidUrl("origin has no host".to_string()))?;
                let scheme = if secure_context { "wss" } else { "ws" };
                let path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };
                match origin.port() {
                    Some(port) => format!("{}://{}:{}{}", scheme, host, port, path),
                    None => format!("{}://{}{}", scheme, host, path),
                }
            }
        };

        Ok(Endpoint { url, secure_context })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_secure_context(&self) -> bool {
        self.secure_context
    }

    /// A secure origin may not open an insecure relay channel
    pub fn is_eligible(&self) -> bool {
        !(self.secure_context && self.url.starts_with("ws://"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_follows_origin() {
        let secure = Endpoint::resolve("https://chat.example.com", None, "/ws").unwrap();
        assert_eq!(secure.url(), "wss://chat.example.com/ws");
        assert!(secure.is_eligible());

        let plain = Endpoint::resolve("http://localhost:8080/app", None, "ws").unwrap();
        assert_eq!(plain.url(), "ws://localhost:8080/ws");
        assert!(!plain.is_secure_context());
        assert!(plain.is_eligible());
    }

    #[test]
    fn test_insecure_relay_from_secure_origin_is_ineligible() {
        let endpoint =
            Endpoint::resolve("https://chat.example.com", Some("ws://relay.example.com/ws"), "/ws").unwrap();
        assert!(!endpoint.is_eligible());
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        assert!(Endpoint::resolve("ftp://example.com", None, "/ws").is_err());
        assert!(Endpoint::resolve("not a url", None, "/ws").is_err());
        assert!(Endpoint::resolve("http://example.com", Some("http://relay/ws"), "/ws").is_err());
    }
}
