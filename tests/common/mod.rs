// Common test utilities for integration tests
// Shared transport doubles, a shared key/value store and a manual timer harness

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};

use log::LevelFilter;

use relaychat::cache::{CacheError, KeyValueStore, MemoryStore};
use relaychat::config::Config;
use relaychat::connection::{TimerKind, TimerToken};
use relaychat::frame;
use relaychat::messenger::{Messenger, TimerRequest};
use relaychat::models::Message;
use relaychat::time::ManualClock;
use relaychat::transport::{
    ChannelId, EventSink, Transport, TransportError, TransportEvent, TransportEventKind, TransportResult,
};

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub const START_MS: i64 = 1_700_000_000_000;

pub fn test_config() -> Config {
    Config {
        origin: "http://localhost:8080".to_string(),
        ..Config::default()
    }
}

/// Key/value store whose contents stay visible to the test after the
/// messenger takes ownership of it
#[derive(Clone, Default)]
pub struct SharedStore(pub Arc<Mutex<MemoryStore>>);

impl SharedStore {
    pub fn raw(&self, key: &str) -> Option<String> {
        self.0.lock().unwrap().get(key).unwrap()
    }

    pub fn json(&self, key: &str) -> Option<serde_json::Value> {
        self.raw(key).map(|raw| serde_json::from_str(&raw).unwrap())
    }
}

impl KeyValueStore for SharedStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.0.lock().unwrap().get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), CacheError> {
        self.0.lock().unwrap().set(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), CacheError> {
        self.0.lock().unwrap().remove(key)
    }
}

/// How the scripted transport reacts to `open`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenBehaviour {
    /// Nothing happens until the test injects an event
    Silent,
    /// Report `Opened` straight away through the sink
    AutoOpen,
    /// `open` itself returns an error
    Refuse,
}

#[derive(Debug)]
pub struct Wire {
    pub opened: Vec<(String, ChannelId)>,
    pub sent: Vec<String>,
    pub closed: usize,
    pub fail_sends: usize,
    pub behaviour: OpenBehaviour,
}

impl Wire {
    pub fn last_channel(&self) -> ChannelId {
        self.opened.last().map(|(_, channel)| *channel).unwrap_or(0)
    }

    /// Decoded text of every frame sent so far
    pub fn texts(&self) -> Vec<String> {
        self.decoded().into_iter().map(|m| m.text).collect()
    }

    pub fn decoded(&self) -> Vec<Message> {
        self.sent
            .iter()
            .map(|raw| frame::decode_message(raw).unwrap().unwrap())
            .collect()
    }
}

pub struct ScriptedTransport {
    wire: Arc<Mutex<Wire>>,
    sink: Option<EventSink>,
}

impl ScriptedTransport {
    pub fn new(behaviour: OpenBehaviour, sink: Option<EventSink>) -> (Self, Arc<Mutex<Wire>>) {
        let wire = Arc::new(Mutex::new(Wire {
            opened: Vec::new(),
            sent: Vec::new(),
            closed: 0,
            fail_sends: 0,
            behaviour,
        }));
        (ScriptedTransport { wire: wire.clone(), sink }, wire)
    }
}

impl Transport for ScriptedTransport {
    fn open(&mut self, url: &str, channel: ChannelId) -> TransportResult<()> {
        let mut wire = self.wire.lock().unwrap();
        if wire.behaviour == OpenBehaviour::Refuse {
            return Err(TransportError::ConnectionFailed("refused".to_string()));
        }
        wire.opened.push((url.to_string(), channel));
        if wire.behaviour == OpenBehaviour::AutoOpen {
            if let Some(sink) = &self.sink {
                let _ = sink.send(TransportEvent::new(channel, TransportEventKind::Opened));
            }
        }
        Ok(())
    }

    fn send(&mut self, frame: &str) -> TransportResult<()> {
        let mut wire = self.wire.lock().unwrap();
        if wire.fail_sends > 0 {
            wire.fail_sends -= 1;
            return Err(TransportError::SendFailed("simulated send failure".to_string()));
        }
        wire.sent.push(frame.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.wire.lock().unwrap().closed += 1;
    }
}

/// Drives a `Messenger` by hand: collects timer requests and fires them on demand
pub struct Harness {
    pub messenger: Messenger,
    pub wire: Arc<Mutex<Wire>>,
    pub store: SharedStore,
    pub clock: ManualClock,
    timers: HashMap<TimerKind, TimerToken>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), SharedStore::default())
    }

    pub fn with(config: Config, store: SharedStore) -> Self {
        setup_logging();
        let clock = ManualClock::new(START_MS);
        let (transport, wire) = ScriptedTransport::new(OpenBehaviour::Silent, None);
        let messenger = Messenger::new(
            &config,
            Box::new(store.clone()),
            Box::new(transport),
            Arc::new(clock.clone()),
        )
        .unwrap();
        let mut harness = Harness {
            messenger,
            wire,
            store,
            clock,
            timers: HashMap::new(),
        };
        harness.pump();
        harness
    }

    /// Move timer requests from the messenger into the local table
    pub fn pump(&mut self) {
        for request in self.messenger.take_timer_requests() {
            match request {
                TimerRequest::Start { token, .. } => {
                    self.timers.insert(token.kind(), token);
                }
                TimerRequest::Cancel(kind) => {
                    self.timers.remove(&kind);
                }
            }
        }
    }

    pub fn has_timer(&self, kind: TimerKind) -> bool {
        self.timers.contains_key(&kind)
    }

    pub fn token(&self, kind: TimerKind) -> Option<TimerToken> {
        self.timers.get(&kind).copied()
    }

    /// Fire the pending timer of `kind`; panics if none is pending
    pub fn fire(&mut self, kind: TimerKind) {
        let token = self
            .timers
            .remove(&kind)
            .unwrap_or_else(|| panic!("no {:?} timer pending", kind));
        self.messenger.handle_timer(token);
        self.pump();
    }

    /// Fire pacing timers until the current flush pass finishes
    pub fn drain_sync(&mut self) {
        while self.has_timer(TimerKind::SyncPace) {
            self.fire(TimerKind::SyncPace);
        }
    }

    pub fn connect(&mut self) {
        self.messenger.connect();
        self.pump();
    }

    pub fn event(&mut self, kind: TransportEventKind) {
        let channel = self.wire.lock().unwrap().last_channel();
        self.messenger.handle_transport_event(TransportEvent::new(channel, kind));
        self.pump();
    }

    /// Connect and report the channel as open
    pub fn go_live(&mut self) {
        self.connect();
        self.event(TransportEventKind::Opened);
    }

    pub fn opens(&self) -> usize {
        self.wire.lock().unwrap().opened.len()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.wire.lock().unwrap().texts()
    }
}
