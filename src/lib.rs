// Re-export needed modules for the binary and the integration tests
pub mod cache;
pub mod config;
pub mod connection;
pub mod events;
pub mod frame;
pub mod messenger;
pub mod models;
pub mod offline;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod time;
pub mod transport;

// Re-export main types for convenience
pub use messenger::{Messenger, Route, SendOutcome};
pub use models::*;
pub use runtime::MessengerHandle;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_format() {
        let id = generate_message_id(1_700_000_000_123);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "msg");
        assert_eq!(parts[1], "1700000000123");
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_message_ids_differ_within_same_millisecond() {
        let a = generate_message_id(5);
        let b = generate_message_id(5);
        assert_ne!(a, b);
    }

    #[test]
    fn test_message_json_matches_legacy_layout() {
        let message = Message::new("msg_1_abc".to_string(), "hello", "alice", "cat.png", 1_650_000_000_000);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["timestamp"], 1_650_000_000_000i64);
        assert_eq!(value["avatar"], "cat.png");
        assert!(value.get("attachment").is_none());

        // Older entries may lack an avatar
        let legacy: Message =
            serde_json::from_str(r#"{"id":"m","text":"t","sender":"s","timestamp":3}"#).unwrap();
        assert_eq!(legacy.avatar, "");
        assert_eq!(legacy.attachment, None);
    }

    #[test]
    fn test_attachment_round_trips_through_json() {
        let message = Message::new("msg_2_x".to_string(), "see file", "bob", "", 2).with_attachment(Attachment {
            name: "notes.txt".to_string(),
            mime_type: "text/plain".to_string(),
            data_ref: "blob:1234".to_string(),
        });
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"mimeType\":\"text/plain\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Offline.to_string(), "offline");
    }
}
