// Message store: ordered log plus the dedup index
//
// Every append is written through to the cache, once as a versioned entry
// under the current key and once as a plain array under the legacy key.

use log::{debug, info};
use std::collections::HashSet;
use std::time::Duration;

use crate::cache::Cache;
use crate::models::{generate_message_id, Attachment, Message};

pub const MESSAGES_KEY: &str = "relaychat.messages";
pub const LEGACY_MESSAGES_KEY: &str = "chatMessages";

pub struct MessageStore {
    messages: Vec<Message>,
    ids: HashSet<String>,
    schema_version: u32,
}

impl MessageStore {
    pub fn new(schema_version: u32) -> Self {
        MessageStore {
            messages: Vec::new(),
            ids: HashSet::new(),
            schema_version,
        }
    }

    /// Rebuild the log from the cache.
    ///
    /// The versioned key wins whenever it exists. If it was present but got
    /// evicted (expired, malformed or another schema version) the legacy copy
    /// written alongside it is dropped too. The legacy array is only read when
    /// the versioned key never existed, and its messages older than `ttl` are
    /// skipped.
    pub fn restore(cache: &mut Cache, schema_version: u32, ttl: Duration) -> Self {
        let mut store = Self::new(schema_version);
        let cached: Vec<Message> = if cache.contains(MESSAGES_KEY) {
            let current = cache.load_versioned(MESSAGES_KEY, Vec::new(), ttl, schema_version);
            if !cache.contains(MESSAGES_KEY) {
                info!("Message log was evicted, dropping the legacy copy as well");
                cache.remove(LEGACY_MESSAGES_KEY);
            }
            current
        } else {
            let mut legacy: Vec<Message> = cache.load_raw(LEGACY_MESSAGES_KEY).unwrap_or_default();
            let oldest = cache.now_ms().saturating_sub(ttl.as_millis() as i64);
            let before = legacy.len();
            legacy.retain(|m| m.timestamp_ms >= oldest);
            if legacy.len() != before {
                debug!("Skipped {} expired legacy messages", before - legacy.len());
            }
            if !legacy.is_empty() {
                info!("Restoring {} messages from legacy cache key", legacy.len());
            }
            legacy
        };
        for message in cached {
            store.insert(message);
        }
        debug!("Message store restored with {} messages", store.len());
        store
    }

    fn insert(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Append unless a message with the same id is already stored.
    /// Returns whether the message was added.
    pub fn append(&mut self, cache: &mut Cache, message: Message) -> bool {
        let id = message.id.clone();
        if !self.insert(message) {
            debug!("Skipping duplicate message {}", id);
            return false;
        }
        self.persist(cache);
        true
    }

    /// Build a new message whose id is not yet in the store
    pub fn compose(
        &self,
        text: &str,
        sender: &str,
        avatar: &str,
        attachment: Option<Attachment>,
        now_ms: i64,
    ) -> Message {
        let mut id = generate_message_id(now_ms);
        while self.ids.contains(&id) {
            id = generate_message_id(now_ms);
        }
        let message = Message::new(id, text, sender, avatar, now_ms);
        match attachment {
            Some(attachment) => message.with_attachment(attachment),
            None => message,
        }
    }

    /// Write the full log under both keys. Failures are logged by the cache.
    pub fn persist(&self, cache: &mut Cache) {
        cache.save(MESSAGES_KEY, &self.messages, self.schema_version);
        cache.save_raw(LEGACY_MESSAGES_KEY, &self.messages);
    }

    pub fn clear(&mut self, cache: &mut Cache) {
        info!("Clearing {} messages", self.messages.len());
        self.messages.clear();
        self.ids.clear();
        cache.remove(MESSAGES_KEY);
        cache.remove(LEGACY_MESSAGES_KEY);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::time::ManualClock;
    use std::sync::Arc;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    fn cache() -> Cache {
        Cache::new(Box::new(MemoryStore::new()), Arc::new(ManualClock::new(1_000)))
    }

    #[test]
    fn test_duplicate_id_is_not_appended() {
        let mut cache = cache();
        let mut store = MessageStore::new(1);
        let message = store.compose("hi", "alice", "", None, 1_000);
        assert!(store.append(&mut cache, message.clone()));
        assert!(!store.append(&mut cache, message));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_append_writes_both_keys() {
        let mut cache = cache();
        let mut store = MessageStore::new(1);
        let message = store.compose("hi", "alice", "", None, 1_000);
        store.append(&mut cache, message.clone());

        let current: Vec<Message> = cache.load_versioned(MESSAGES_KEY, vec![], WEEK, 1);
        let legacy: Vec<Message> = cache.load_raw(LEGACY_MESSAGES_KEY).unwrap();
        assert_eq!(current, vec![message.clone()]);
        assert_eq!(legacy, vec![message]);
    }

    #[test]
    fn test_restore_falls_back_to_legacy_array() {
        let mut cache = cache();
        let legacy = vec![
            Message::new("msg_1_a".into(), "one", "bob", "", 1),
            Message::new("msg_1_a".into(), "one again", "bob", "", 1),
            Message::new("msg_2_b".into(), "two", "bob", "", 2),
        ];
        cache.save_raw(LEGACY_MESSAGES_KEY, &legacy);
        let store = MessageStore::restore(&mut cache, 1, WEEK);
        assert_eq!(store.len(), 2);
        assert_eq!(store.messages()[1].text, "two");
    }

    #[test]
    fn test_clear_empties_store_and_cache() {
        let mut cache = cache();
        let mut store = MessageStore::new(1);
        let message = store.compose("hi", "alice", "", None, 1_000);
        store.append(&mut cache, message.clone());
        store.clear(&mut cache);
        assert!(store.is_empty());
        assert!(!store.contains(&message.id));
        assert!(cache.load_raw::<Vec<Message>>(LEGACY_MESSAGES_KEY).is_none());
        assert!(MessageStore::restore(&mut cache, 1, WEEK).is_empty());
    }

    #[test]
    fn test_expired_log_does_not_come_back_through_legacy_key() {
        let clock = ManualClock::new(1_000);
        let mut cache = Cache::new(Box::new(MemoryStore::new()), Arc::new(clock.clone()));
        let mut store = MessageStore::new(1);
        let message = store.compose("old news", "alice", "", None, 1_000);
        store.append(&mut cache, message);

        clock.advance(WEEK + Duration::from_millis(1));
        let restored = MessageStore::restore(&mut cache, 1, WEEK);
        assert!(restored.is_empty());
        assert!(!cache.contains(MESSAGES_KEY));
        assert!(!cache.contains(LEGACY_MESSAGES_KEY));
    }

    #[test]
    fn test_schema_bump_discards_both_copies() {
        let mut cache = cache();
        let mut store = MessageStore::new(1);
        let message = store.compose("v1 data", "alice", "", None, 1_000);
        store.append(&mut cache, message);

        let restored = MessageStore::restore(&mut cache, 2, WEEK);
        assert!(restored.is_empty());
        assert!(!cache.contains(LEGACY_MESSAGES_KEY));
    }

    #[test]
    fn test_legacy_only_messages_past_ttl_are_skipped() {
        let clock = ManualClock::new(0);
        let mut cache = Cache::new(Box::new(MemoryStore::new()), Arc::new(clock.clone()));
        let now = WEEK.as_millis() as i64 + 10;
        clock.set(now);
        let legacy = vec![
            Message::new("msg_9_old".into(), "stale", "bob", "", 9),
            Message::new("msg_10_edge".into(), "exactly a week", "bob", "", 10),
            Message::new("msg_n_new".into(), "fresh", "bob", "", now),
        ];
        cache.save_raw(LEGACY_MESSAGES_KEY, &legacy);

        let restored = MessageStore::restore(&mut cache, 1, WEEK);
        let texts: Vec<&str> = restored.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["exactly a week", "fresh"]);
    }
}
