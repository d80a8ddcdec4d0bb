// src/messenger.rs
//! Messaging context
//!
//! `Messenger` owns the cache, the connection manager, the offline controller,
//! the message store and the sync engine. It is created once by the
//! application root and driven from a single task: every public method runs one
//! state transition to completion and executes the commands it produced.
//! Timer commands are handed to the driver through `take_timer_requests`.

use log::{debug, info, warn};

use crate::cache::{Cache, KeyValueStore};
use crate::config::Config;
use crate::connection::{Command, ConnectionManager, TimerKind, TimerToken, Transition};
use crate::events::{EventBus, MessengerEvent};
use crate::frame;
use crate::models::{Attachment, ConnectionState, Message, StatusSnapshot};
use crate::offline::{OfflineMode, OfflineReason};
use crate::store::MessageStore;
use crate::sync::{SyncEngine, SyncStep};
use crate::time::SharedClock;
use crate::transport::{Endpoint, Transport, TransportEvent, TransportResult};

pub const FAILURES_KEY: &str = "relaychat.failures";

/// Timer work for the driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimerRequest {
    Start { token: TimerToken, delay: std::time::Duration },
    Cancel(TimerKind),
}

/// How a sent message left the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Live,
    Queued,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub message: Message,
    pub route: Route,
}

pub struct Messenger {
    cache: Cache,
    link: ConnectionManager,
    offline: OfflineMode,
    store: MessageStore,
    sync: SyncEngine,
    events: EventBus,
    timers: Vec<TimerRequest>,
    reported_state: ConnectionState,
}

impl Messenger {
    /// Build the context and restore everything persisted by a previous run
    pub fn new(
        config: &Config,
        backend: Box<dyn KeyValueStore>,
        transport: Box<dyn Transport>,
        clock: SharedClock,
    ) -> TransportResult<Self> {
        let endpoint = Endpoint::resolve(&config.origin, config.relay_url.as_deref(), &config.relay_path)?;
        let mut cache = Cache::new(backend, clock);

        let offline = OfflineMode::restore(&mut cache, config.offline_grace());
        let failures: u32 = cache.load_raw(FAILURES_KEY).unwrap_or(0);
        let store = MessageStore::restore(&mut cache, config.schema_version, config.cache_ttl());
        let sync = SyncEngine::restore(&mut cache, config.sync_pacing());
        let link = ConnectionManager::new(
            transport,
            endpoint,
            config.connection_settings(),
            failures,
            offline.is_enabled(),
        );

        info!(
            "Messenger ready: {} messages, {} pending, offline={}",
            store.len(),
            sync.pending_len(),
            offline.is_enabled()
        );

        let reported_state = link.state();
        Ok(Messenger {
            cache,
            link,
            offline,
            store,
            sync,
            events: EventBus::default(),
            timers: Vec::new(),
            reported_state,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MessengerEvent> {
        self.events.subscribe()
    }

    /// Connect unless offline mode is on
    pub fn start(&mut self) {
        self.connect();
    }

    pub fn connect(&mut self) {
        let transition = self.link.connect(self.offline.is_enabled());
        self.apply(transition);
    }

    /// Optimistically append a new message, then send it live or queue it
    pub fn send(&mut self, text: &str, sender: &str, avatar: &str) -> SendOutcome {
        self.send_with_attachment(text, sender, avatar, None)
    }

    pub fn send_with_attachment(
        &mut self,
        text: &str,
        sender: &str,
        avatar: &str,
        attachment: Option<Attachment>,
    ) -> SendOutcome {
        let now = self.cache.now_ms();
        let message = self.store.compose(text, sender, avatar, attachment, now);
        if self.store.append(&mut self.cache, message.clone()) {
            self.events.publish(MessengerEvent::MessageAdded(message.clone()));
        }

        let route = if self.link.state() == ConnectionState::Connected {
            match self.link.transmit(&message, false) {
                Ok(()) => Route::Live,
                Err(e) => {
                    warn!("Live send of {} failed, queueing: {}", message.id, e);
                    self.sync.enqueue(&mut self.cache, message.clone());
                    Route::Queued
                }
            }
        } else {
            debug!("Not connected ({}), queueing {}", self.link.state(), message.id);
            self.sync.enqueue(&mut self.cache, message.clone());
            Route::Queued
        };

        SendOutcome { message, route }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        let transition = self.link.handle_event(event);
        self.apply(transition);
    }

    /// Route a fired timer to the component that armed it
    pub fn handle_timer(&mut self, token: TimerToken) {
        match token.kind() {
            TimerKind::ConnectTimeout | TimerKind::Reconnect => {
                let transition = self.link.handle_timer(token, self.offline.is_enabled());
                self.apply(transition);
            }
            TimerKind::SyncPace => {
                let step = self.sync.handle_timer(token, &mut self.link, &mut self.cache, &self.store);
                self.apply_sync(step);
            }
            TimerKind::OfflineGrace => {
                if self.offline.handle_timer(token) {
                    self.flush();
                }
            }
        }
    }

    /// Turn offline mode on at the user's request
    pub fn enable_offline(&mut self) {
        self.enter_offline(OfflineReason::User);
    }

    fn enter_offline(&mut self, reason: OfflineReason) {
        let Some(commands) = self.offline.enable(&mut self.cache, reason) else {
            return;
        };
        self.run_commands(commands);
        let cancelled = self.sync.cancel();
        self.run_commands(cancelled);
        let transition = self.link.go_offline();
        self.apply(transition);
        self.events.publish(MessengerEvent::OfflineModeChanged { enabled: true, reason });
    }

    /// Turn offline mode off, reconnect and flush after the grace delay
    pub fn disable_offline(&mut self) {
        let Some(grace) = self.offline.disable(&mut self.cache) else {
            return;
        };
        let transition = self.link.go_online();
        self.apply(transition);
        self.events.publish(MessengerEvent::OfflineModeChanged {
            enabled: false,
            reason: OfflineReason::User,
        });
        self.connect();
        self.run_commands(grace);
    }

    pub fn flush(&mut self) {
        let step = self.sync.flush(&mut self.link, &mut self.cache, &self.store);
        self.apply_sync(step);
    }

    /// Drop every stored message and its cache keys
    pub fn clear(&mut self) {
        self.store.clear(&mut self.cache);
    }

    /// Close the channel and cancel all timers
    pub fn shutdown(&mut self) {
        info!("Shutting down messenger");
        let cancelled = self.sync.cancel();
        self.run_commands(cancelled);
        self.link.shutdown();
        for kind in [TimerKind::ConnectTimeout, TimerKind::Reconnect, TimerKind::OfflineGrace] {
            self.timers.push(TimerRequest::Cancel(kind));
        }
    }

    pub fn take_timer_requests(&mut self) -> Vec<TimerRequest> {
        std::mem::take(&mut self.timers)
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn is_offline(&self) -> bool {
        self.offline.is_enabled()
    }

    pub fn failures(&self) -> u32 {
        self.link.failures()
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn pending(&self) -> Vec<Message> {
        self.sync.pending().cloned().collect()
    }

    pub fn last_sync_ms(&self) -> Option<i64> {
        self.sync.last_sync_ms()
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.link.state(),
            offline: self.offline.is_enabled(),
            failures: self.link.failures(),
            pending: self.sync.pending_len(),
            messages: self.store.len(),
            last_sync_ms: self.sync.last_sync_ms(),
        }
    }

    fn receive(&mut self, raw: &str) {
        match frame::decode_message(raw) {
            Ok(Some(message)) => {
                if self.store.append(&mut self.cache, message.clone()) {
                    debug!("Received message {} from {}", message.id, message.sender);
                    self.events.publish(MessengerEvent::MessageAdded(message));
                }
            }
            Ok(None) => debug!("Ignoring non-message frame"),
            Err(e) => warn!("Dropping undecodable frame: {}", e),
        }
    }

    fn apply(&mut self, transition: Transition) {
        self.publish_state(transition.state);
        self.run_commands(transition.commands);
    }

    fn apply_sync(&mut self, step: SyncStep) {
        self.run_commands(step.commands);
        if let Some(report) = step.completed {
            self.events.publish(MessengerEvent::SyncCompleted(report));
        }
    }

    fn run_commands(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::StartTimer { token, delay } => {
                    self.timers.push(TimerRequest::Start { token, delay });
                }
                Command::CancelTimer(kind) => self.timers.push(TimerRequest::Cancel(kind)),
                Command::Flush => self.flush(),
                Command::EnterOffline => self.enter_offline(OfflineReason::FailureThreshold),
                Command::PersistFailures(count) => {
                    self.cache.save_raw(FAILURES_KEY, &count);
                }
                Command::Inbound(raw) => self.receive(&raw),
            }
        }
    }

    fn publish_state(&mut self, state: ConnectionState) {
        if state != self.reported_state {
            self.reported_state = state;
            self.events.publish(MessengerEvent::StateChanged(state));
        }
    }
}
