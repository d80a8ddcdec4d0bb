// Offline mode controller
//
// Holds the single flag that decides whether live transport attempts are
// allowed. The flag is written under two keys so older clients that only know
// the legacy key read the same state.

use log::{debug, info};
use serde_json::Value;
use std::time::Duration;

use crate::cache::Cache;
use crate::connection::{Command, TimerKind, TimerSlot, TimerToken};

pub const OFFLINE_KEY: &str = "relaychat.offline_mode";
pub const LEGACY_OFFLINE_KEY: &str = "offlineMode";

/// Why offline mode was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    User,
    FailureThreshold,
}

pub struct OfflineMode {
    enabled: bool,
    grace_delay: Duration,
    grace: TimerSlot,
}

// Older clients stored the flag as the string "true"
fn flag_value(value: Option<Value>) -> Option<bool> {
    match value? {
        Value::Bool(flag) => Some(flag),
        Value::String(s) => Some(s == "true"),
        _ => None,
    }
}

impl OfflineMode {
    /// Read the persisted flag; either key being set counts
    pub fn restore(cache: &mut Cache, grace_delay: Duration) -> Self {
        let current = flag_value(cache.load_raw::<Value>(OFFLINE_KEY));
        let legacy = flag_value(cache.load_raw::<Value>(LEGACY_OFFLINE_KEY));
        let enabled = current.unwrap_or(false) || legacy.unwrap_or(false);
        if enabled {
            info!("Restored offline mode from storage");
        }
        OfflineMode {
            enabled,
            grace_delay,
            grace: TimerSlot::new(TimerKind::OfflineGrace),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn persist(&self, cache: &mut Cache) {
        cache.save_raw(OFFLINE_KEY, &self.enabled);
        cache.save_raw(LEGACY_OFFLINE_KEY, &self.enabled);
    }

    /// Set and persist the flag. `None` when it was already set.
    pub fn enable(&mut self, cache: &mut Cache, reason: OfflineReason) -> Option<Vec<Command>> {
        if self.enabled {
            debug!("Offline mode already enabled");
            return None;
        }
        info!("Entering offline mode ({:?})", reason);
        self.enabled = true;
        self.persist(cache);
        Some(self.grace.disarm().into_iter().collect())
    }

    /// Clear and persist the flag, then arm the grace timer after which the
    /// pending queue is flushed. `None` when offline mode was not on.
    pub fn disable(&mut self, cache: &mut Cache) -> Option<Vec<Command>> {
        if !self.enabled {
            debug!("Offline mode already disabled");
            return None;
        }
        info!("Leaving offline mode");
        self.enabled = false;
        self.persist(cache);
        Some(vec![self.grace.arm(self.grace_delay)])
    }

    /// True when `token` is the live grace timer and a flush is due
    pub fn handle_timer(&mut self, token: TimerToken) -> bool {
        self.grace.accept(token)
    }
}
