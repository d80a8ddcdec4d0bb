// Sync engine: drains the pending queue once the relay is reachable
//
// A flush is a paced pass over a snapshot of the queue. One message goes out
// per step and the next step is scheduled on the pacing timer. A message is
// removed from the queue only after the transport accepted it; failed ones stay
// queued for the next pass.

use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use crate::cache::Cache;
use crate::connection::{Command, ConnectionManager, TimerKind, TimerSlot, TimerToken};
use crate::models::{ConnectionState, Message};
use crate::store::MessageStore;

pub const PENDING_KEY: &str = "relaychat.pending";
pub const LAST_SYNC_KEY: &str = "relaychat.last_sync";

// How many synced ids are remembered to refuse a second enqueue
const DELIVERED_HISTORY: usize = 1024;

/// Outcome of a completed flush pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Debug, Default, PartialEq)]
pub struct SyncStep {
    pub commands: Vec<Command>,
    pub completed: Option<SyncReport>,
}

struct SyncPass {
    remaining: VecDeque<Message>,
    sent: usize,
    failed: usize,
}

pub struct SyncEngine {
    queue: VecDeque<Message>,
    delivered: HashSet<String>,
    delivered_order: VecDeque<String>,
    pass: Option<SyncPass>,
    pacing: Duration,
    pace: TimerSlot,
    last_sync_ms: Option<i64>,
}

impl SyncEngine {
    pub fn new(pacing: Duration) -> Self {
        SyncEngine {
            queue: VecDeque::new(),
            delivered: HashSet::new(),
            delivered_order: VecDeque::new(),
            pass: None,
            pacing,
            pace: TimerSlot::new(TimerKind::SyncPace),
            last_sync_ms: None,
        }
    }

    /// Reload the pending queue and last sync time
    pub fn restore(cache: &mut Cache, pacing: Duration) -> Self {
        let mut engine = Self::new(pacing);
        let pending: Vec<Message> = cache.load_raw(PENDING_KEY).unwrap_or_default();
        if !pending.is_empty() {
            info!("Restored {} pending messages", pending.len());
        }
        engine.queue = pending.into();
        engine.last_sync_ms = cache.load_raw(LAST_SYNC_KEY);
        engine
    }

    fn persist_queue(&self, cache: &mut Cache) {
        cache.save_raw(PENDING_KEY, &self.queue);
    }

    pub fn enqueue(&mut self, cache: &mut Cache, message: Message) {
        if self.delivered.contains(&message.id) || self.queue.iter().any(|m| m.id == message.id) {
            debug!("Message {} already queued or delivered", message.id);
            return;
        }
        debug!("Queueing message {} for later delivery", message.id);
        self.queue.push_back(message);
        self.persist_queue(cache);
    }

    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_flushing(&self) -> bool {
        self.pass.is_some()
    }

    pub fn last_sync_ms(&self) -> Option<i64> {
        self.last_sync_ms
    }

    // Only ids that went through the queue are tracked, oldest dropped first
    fn remember_delivered(&mut self, id: &str) {
        if !self.delivered.insert(id.to_string()) {
            return;
        }
        self.delivered_order.push_back(id.to_string());
        while self.delivered_order.len() > DELIVERED_HISTORY {
            if let Some(oldest) = self.delivered_order.pop_front() {
                self.delivered.remove(&oldest);
            }
        }
    }

    /// Start a pass over the queue. No-op unless connected and idle.
    pub fn flush(
        &mut self,
        link: &mut ConnectionManager,
        cache: &mut Cache,
        store: &MessageStore,
    ) -> SyncStep {
        if link.state() != ConnectionState::Connected {
            warn!("Cannot flush pending messages while {}", link.state());
            return SyncStep::default();
        }
        if self.pass.is_some() {
            debug!("Flush already in progress");
            return SyncStep::default();
        }

        // Anything already confirmed is dropped rather than resent
        let before = self.queue.len();
        let delivered = &self.delivered;
        self.queue.retain(|m| !delivered.contains(&m.id));
        if self.queue.len() != before {
            self.persist_queue(cache);
        }

        info!("Flushing {} pending messages", self.queue.len());
        self.pass = Some(SyncPass {
            remaining: self.queue.iter().cloned().collect(),
            sent: 0,
            failed: 0,
        });
        self.step(link, cache, store)
    }

    /// Pacing timer fired
    pub fn handle_timer(
        &mut self,
        token: TimerToken,
        link: &mut ConnectionManager,
        cache: &mut Cache,
        store: &MessageStore,
    ) -> SyncStep {
        if !self.pace.accept(token) {
            return SyncStep::default();
        }
        self.step(link, cache, store)
    }

    fn step(
        &mut self,
        link: &mut ConnectionManager,
        cache: &mut Cache,
        store: &MessageStore,
    ) -> SyncStep {
        let Some(mut pass) = self.pass.take() else {
            return SyncStep::default();
        };

        if link.state() != ConnectionState::Connected {
            warn!(
                "Connection lost during flush, {} messages stay queued",
                pass.remaining.len()
            );
            return SyncStep::default();
        }

        if let Some(message) = pass.remaining.pop_front() {
            match link.transmit(&message, true) {
                Ok(()) => {
                    debug!("Synced message {}", message.id);
                    pass.sent += 1;
                    self.remember_delivered(&message.id);
                    self.queue.retain(|m| m.id != message.id);
                }
                Err(e) => {
                    warn!("Failed to sync message {}, keeping it queued: {}", message.id, e);
                    pass.failed += 1;
                    // Move it behind anything still waiting so the next pass retries it last
                    if let Some(index) = self.queue.iter().position(|m| m.id == message.id) {
                        if let Some(failed) = self.queue.remove(index) {
                            self.queue.push_back(failed);
                        }
                    }
                }
            }
            self.persist_queue(cache);
        }

        if !pass.remaining.is_empty() {
            self.pass = Some(pass);
            return SyncStep {
                commands: vec![self.pace.arm(self.pacing)],
                completed: None,
            };
        }

        let report = SyncReport { sent: pass.sent, failed: pass.failed };
        let now = cache.now_ms();
        self.last_sync_ms = Some(now);
        cache.save_raw(LAST_SYNC_KEY, &now);
        store.persist(cache);
        info!("Sync pass complete: {} sent, {} failed", report.sent, report.failed);
        SyncStep {
            commands: Vec::new(),
            completed: Some(report),
        }
    }

    /// Abandon a running pass; queued messages are kept
    pub fn cancel(&mut self) -> Vec<Command> {
        self.pass = None;
        self.pace.disarm().into_iter().collect()
    }
}
