// Connection management for the relay channel
//
// The manager is the only owner of the transport handle, the consecutive
// failure counter and the reconnect timer. Every transition function returns
// the resulting state plus the commands the messenger has to carry out.

use log::{debug, error, info, warn};
use std::time::Duration;

use crate::frame;
use crate::models::{ConnectionState, Message};
use crate::transport::{ChannelId, Endpoint, Transport, TransportError, TransportEvent, TransportEventKind, TransportResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ConnectTimeout,
    Reconnect,
    SyncPace,
    OfflineGrace,
}

/// Handle for one armed timer. Only the most recently armed token of a kind
/// is honoured when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    kind: TimerKind,
    generation: u64,
}

impl TimerToken {
    pub fn kind(&self) -> TimerKind {
        self.kind
    }
}

/// One timer of a given kind that can be armed, disarmed and matched against
/// a fired token
#[derive(Debug)]
pub(crate) struct TimerSlot {
    kind: TimerKind,
    generation: u64,
    armed: bool,
}

impl TimerSlot {
    pub(crate) fn new(kind: TimerKind) -> Self {
        TimerSlot { kind, generation: 0, armed: false }
    }

    pub(crate) fn arm(&mut self, delay: Duration) -> Command {
        self.generation += 1;
        self.armed = true;
        Command::StartTimer {
            token: TimerToken { kind: self.kind, generation: self.generation },
            delay,
        }
    }

    /// Returns a cancel command if the slot was armed
    pub(crate) fn disarm(&mut self) -> Option<Command> {
        if self.armed {
            self.armed = false;
            Some(Command::CancelTimer(self.kind))
        } else {
            None
        }
    }

    /// Consume a fired token. False for stale or cancelled timers.
    pub(crate) fn accept(&mut self, token: TimerToken) -> bool {
        if token.kind == self.kind && token.generation == self.generation && self.armed {
            self.armed = false;
            true
        } else {
            false
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }
}

/// Side effects requested by a state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartTimer { token: TimerToken, delay: Duration },
    CancelTimer(TimerKind),
    /// Drain the pending queue
    Flush,
    /// Failure threshold reached; switch to offline mode
    EnterOffline,
    /// Persist the consecutive failure counter
    PersistFailures(u32),
    /// Raw inbound frame for the message store
    Inbound(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: ConnectionState,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub failure_threshold: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

pub struct ConnectionManager {
    transport: Box<dyn Transport>,
    endpoint: Endpoint,
    settings: ConnectionSettings,
    state: ConnectionState,
    failures: u32,
    // Channel whose events we still act on
    live_channel: Option<ChannelId>,
    next_channel: ChannelId,
    connect_timeout: TimerSlot,
    reconnect: TimerSlot,
}

impl ConnectionManager {
    pub fn new(
        transport: Box<dyn Transport>,
        endpoint: Endpoint,
        settings: ConnectionSettings,
        failures: u32,
        offline: bool,
    ) -> Self {
        ConnectionManager {
            transport,
            endpoint,
            settings,
            state: if offline { ConnectionState::Offline } else { ConnectionState::Disconnected },
            failures,
            live_channel: None,
            next_channel: 0,
            connect_timeout: TimerSlot::new(TimerKind::ConnectTimeout),
            reconnect: TimerSlot::new(TimerKind::Reconnect),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_reconnect_scheduled(&self) -> bool {
        self.reconnect.is_armed()
    }

    fn transition(&self, commands: Vec<Command>) -> Transition {
        Transition { state: self.state, commands }
    }

    /// Start opening the channel unless offline mode is on or a channel is
    /// already open or opening
    pub fn connect(&mut self, offline: bool) -> Transition {
        if offline || self.state == ConnectionState::Offline {
            debug!("Offline mode is active, not connecting");
            return self.transition(Vec::new());
        }
        if matches!(self.state, ConnectionState::Connected | ConnectionState::Connecting) {
            debug!("Channel already {}, ignoring connect", self.state);
            return self.transition(Vec::new());
        }

        let mut commands: Vec<Command> = self.reconnect.disarm().into_iter().collect();

        if !self.endpoint.is_eligible() {
            warn!(
                "Relay {} is not reachable from a secure origin, skipping connection attempt",
                self.endpoint.url()
            );
            commands.extend(self.register_failure());
            return self.transition(commands);
        }

        self.next_channel += 1;
        let channel = self.next_channel;
        info!("Connecting to relay {} (channel {})", self.endpoint.url(), channel);
        match self.transport.open(self.endpoint.url(), channel) {
            Ok(()) => {
                self.live_channel = Some(channel);
                self.state = ConnectionState::Connecting;
                commands.push(self.connect_timeout.arm(self.settings.connect_timeout));
            }
            Err(e) => {
                error!("Failed to start connection attempt: {}", e);
                commands.extend(self.register_failure());
            }
        }
        self.transition(commands)
    }

    /// Route one transport event. Events from retired channels are dropped.
    pub fn handle_event(&mut self, event: TransportEvent) -> Transition {
        if self.live_channel != Some(event.channel) {
            debug!("Ignoring {:?} from retired channel {}", event.kind, event.channel);
            return self.transition(Vec::new());
        }
        match event.kind {
            TransportEventKind::Opened => self.on_open(),
            TransportEventKind::Frame(raw) => self.transition(vec![Command::Inbound(raw)]),
            TransportEventKind::Error(reason) => {
                warn!("Transport error: {}", reason);
                self.on_failure()
            }
            TransportEventKind::Closed => {
                info!("Transport channel closed");
                self.on_failure()
            }
        }
    }

    fn on_open(&mut self) -> Transition {
        if self.state != ConnectionState::Connecting {
            debug!("Open event while {}, ignoring", self.state);
            return self.transition(Vec::new());
        }
        let mut commands: Vec<Command> = self.connect_timeout.disarm().into_iter().collect();
        commands.extend(self.reconnect.disarm());
        self.failures = 0;
        commands.push(Command::PersistFailures(0));
        self.state = ConnectionState::Connected;
        info!("Connected to relay {}", self.endpoint.url());
        commands.push(Command::Flush);
        self.transition(commands)
    }

    // Error and close land here; the channel is retired so a close that
    // follows an error on the same channel is not counted twice.
    fn on_failure(&mut self) -> Transition {
        self.transport.close();
        self.live_channel = None;
        let mut commands: Vec<Command> = self.connect_timeout.disarm().into_iter().collect();
        commands.extend(self.register_failure());
        self.transition(commands)
    }

    /// Fired timers owned by the manager. `offline` is the current mode flag.
    pub fn handle_timer(&mut self, token: TimerToken, offline: bool) -> Transition {
        match token.kind() {
            TimerKind::ConnectTimeout => {
                if !self.connect_timeout.accept(token) || self.state != ConnectionState::Connecting {
                    return self.transition(Vec::new());
                }
                warn!("Connection attempt timed out after {:?}", self.settings.connect_timeout);
                self.transport.close();
                self.live_channel = None;
                let commands = self.register_failure();
                self.transition(commands)
            }
            TimerKind::Reconnect => {
                if !self.reconnect.accept(token) {
                    return self.transition(Vec::new());
                }
                info!("Reconnect timer fired");
                self.connect(offline)
            }
            other => {
                debug!("Connection manager ignoring {:?} timer", other);
                self.transition(Vec::new())
            }
        }
    }

    // Single place that counts failures and decides between a reconnect and
    // offline promotion
    fn register_failure(&mut self) -> Vec<Command> {
        self.state = ConnectionState::Disconnected;
        self.failures += 1;
        let mut commands = vec![Command::PersistFailures(self.failures)];
        if self.failures >= self.settings.failure_threshold {
            warn!(
                "{} consecutive connection failures, switching to offline mode",
                self.failures
            );
            commands.extend(self.reconnect.disarm());
            commands.push(Command::EnterOffline);
        } else {
            info!(
                "Connection failure {}/{}, reconnecting in {:?}",
                self.failures, self.settings.failure_threshold, self.settings.reconnect_delay
            );
            commands.push(self.reconnect.arm(self.settings.reconnect_delay));
        }
        commands
    }

    /// Close everything and park in `Offline`. Resets the failure counter.
    pub fn go_offline(&mut self) -> Transition {
        if self.live_channel.take().is_some() {
            self.transport.close();
        }
        let mut commands: Vec<Command> = self.connect_timeout.disarm().into_iter().collect();
        commands.extend(self.reconnect.disarm());
        self.failures = 0;
        commands.push(Command::PersistFailures(0));
        self.state = ConnectionState::Offline;
        self.transition(commands)
    }

    /// Leave `Offline` without connecting yet
    pub fn go_online(&mut self) -> Transition {
        let mut commands: Vec<Command> = self.reconnect.disarm().into_iter().collect();
        if self.state == ConnectionState::Offline {
            self.state = ConnectionState::Disconnected;
        }
        self.failures = 0;
        commands.push(Command::PersistFailures(0));
        self.transition(commands)
    }

    /// Send one message over the open channel
    pub fn transmit(&mut self, message: &Message, sync: bool) -> TransportResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let raw = frame::encode_message(message, sync)?;
        self.transport.send(&raw)
    }

    pub fn shutdown(&mut self) {
        if self.live_channel.take().is_some() {
            self.transport.close();
        }
        self.connect_timeout.disarm();
        self.reconnect.disarm();
        if self.state != ConnectionState::Offline {
            self.state = ConnectionState::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        opened: Vec<ChannelId>,
        sent: Vec<String>,
        closed: usize,
    }

    struct Recorder(Arc<Mutex<Log>>);

    impl Transport for Recorder {
        fn open(&mut self, _url: &str, channel: ChannelId) -> TransportResult<()> {
            self.0.lock().unwrap().opened.push(channel);
            Ok(())
        }
        fn send(&mut self, frame: &str) -> TransportResult<()> {
            self.0.lock().unwrap().sent.push(frame.to_string());
            Ok(())
        }
        fn close(&mut self) {
            self.0.lock().unwrap().closed += 1;
        }
    }

    fn manager(origin: &str, relay: Option<&str>) -> (ConnectionManager, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let endpoint = Endpoint::resolve(origin, relay, "/ws").unwrap();
        let manager = ConnectionManager::new(
            Box::new(Recorder(log.clone())),
            endpoint,
            ConnectionSettings::default(),
            0,
            false,
        );
        (manager, log)
    }

    fn timer(commands: &[Command], kind: TimerKind) -> TimerToken {
        commands
            .iter()
            .find_map(|c| match c {
                Command::StartTimer { token, .. } if token.kind() == kind => Some(*token),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_connect_arms_timeout_and_open_resets_failures() {
        let (mut m, log) = manager("http://localhost:8080", None);
        let t = m.connect(false);
        assert_eq!(t.state, ConnectionState::Connecting);
        timer(&t.commands, TimerKind::ConnectTimeout);

        let t = m.handle_event(TransportEvent::new(1, TransportEventKind::Opened));
        assert_eq!(t.state, ConnectionState::Connected);
        assert!(t.commands.contains(&Command::CancelTimer(TimerKind::ConnectTimeout)));
        assert!(t.commands.contains(&Command::Flush));
        assert_eq!(m.failures(), 0);
        assert_eq!(log.lock().unwrap().opened, vec![1]);
    }

    #[test]
    fn test_connect_is_noop_while_opening_or_offline() {
        let (mut m, log) = manager("http://localhost", None);
        m.connect(false);
        assert!(m.connect(false).commands.is_empty());
        assert!(m.connect(true).commands.is_empty());
        assert_eq!(log.lock().unwrap().opened.len(), 1);
    }

    #[test]
    fn test_error_then_close_counts_once() {
        let (mut m, _log) = manager("http://localhost", None);
        m.connect(false);
        m.handle_event(TransportEvent::new(1, TransportEventKind::Opened));
        let t = m.handle_event(TransportEvent::new(1, TransportEventKind::Error("reset".into())));
        assert_eq!(t.state, ConnectionState::Disconnected);
        timer(&t.commands, TimerKind::Reconnect);
        let t = m.handle_event(TransportEvent::new(1, TransportEventKind::Closed));
        assert!(t.commands.is_empty());
        assert_eq!(m.failures(), 1);
    }

    #[test]
    fn test_ineligible_endpoint_fails_without_opening() {
        let (mut m, log) = manager("https://secure.example.com", Some("ws://relay.example.com/ws"));
        let t = m.connect(false);
        assert_eq!(t.state, ConnectionState::Disconnected);
        assert!(t.commands.contains(&Command::PersistFailures(1)));
        assert!(log.lock().unwrap().opened.is_empty());
    }

    #[test]
    fn test_threshold_promotes_instead_of_reconnecting() {
        let (mut m, _log) = manager("http://localhost", None);
        let mut last = Vec::new();
        for attempt in 1..=3u32 {
            let t = m.connect(false);
            let timeout = timer(&t.commands, TimerKind::ConnectTimeout);
            last = m.handle_timer(timeout, false).commands;
            assert_eq!(m.failures(), attempt);
            if attempt < 3 {
                let reconnect = timer(&last, TimerKind::Reconnect);
                // Reconnect goes through connect() in the real flow; drain it here
                assert!(m.reconnect.accept(reconnect));
            }
        }
        assert!(last.contains(&Command::EnterOffline));
        assert!(!last.iter().any(|c| matches!(c, Command::StartTimer { .. })));
    }

    #[test]
    fn test_stale_timeout_is_ignored_after_open() {
        let (mut m, _log) = manager("http://localhost", None);
        let t = m.connect(false);
        let timeout = timer(&t.commands, TimerKind::ConnectTimeout);
        m.handle_event(TransportEvent::new(1, TransportEventKind::Opened));
        let t = m.handle_timer(timeout, false);
        assert_eq!(t.state, ConnectionState::Connected);
        assert!(t.commands.is_empty());
    }

    #[test]
    fn test_transmit_requires_connected() {
        let (mut m, log) = manager("http://localhost", None);
        let message = Message::new("msg_1_a".into(), "hi", "me", "", 1);
        assert!(matches!(m.transmit(&message, false), Err(TransportError::NotConnected)));
        m.connect(false);
        m.handle_event(TransportEvent::new(1, TransportEventKind::Opened));
        m.transmit(&message, false).unwrap();
        assert_eq!(log.lock().unwrap().sent.len(), 1);
    }
}
