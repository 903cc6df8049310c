//! Per-identity check-in dedup window.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

pub const DEFAULT_DEDUP_WINDOW_MS: u64 = 30_000;

/// Decides whether a matched detection becomes a new check-in.
///
/// Two accepted check-ins for the same identity are always at least
/// `window` apart. Decisions take `&mut self`, so the owner serializes
/// them; the pipeline holds the only instance.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    last_accepted: HashMap<String, DateTime<Utc>>,
}

impl Deduplicator {
    /// Windows beyond what `Duration` can hold saturate to `Duration::MAX`.
    pub fn new(window_ms: u64) -> Self {
        let window = i64::try_from(window_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .unwrap_or(Duration::MAX);
        Self {
            window,
            last_accepted: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Accept iff there is no prior record for `identity_id` or the last
    /// accepted check-in is at least one window old. Acceptance records
    /// `now` as the new reference point; suppression leaves it untouched.
    pub fn should_accept(&mut self, identity_id: &str, now: DateTime<Utc>) -> bool {
        match self.last_accepted.get(identity_id) {
            Some(last) if now.signed_duration_since(*last) < self.window => false,
            _ => {
                self.last_accepted.insert(identity_id.to_string(), now);
                true
            }
        }
    }

    /// Seed a reference point from durable history. Keeps the later of
    /// the existing and supplied timestamps.
    pub fn seed(&mut self, identity_id: &str, at: DateTime<Utc>) {
        let entry = self.last_accepted.entry(identity_id.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    /// Drop records whose window has fully elapsed. Such identities would
    /// be accepted anyway, so pruning never changes a decision.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.last_accepted.len();
        let window = self.window;
        self.last_accepted
            .retain(|_, last| now.signed_duration_since(*last) < window);
        before - self.last_accepted.len()
    }

    pub fn tracked(&self) -> usize {
        self.last_accepted.len()
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW_MS)
    }
}
