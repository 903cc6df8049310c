//! Live system state shared with observers.
//!
//! [`StateAggregator`] is the only writer. Everything else holds a
//! [`SnapshotReader`], which hands out owned copies and has no way to
//! mutate the underlying state.

use crate::clock::Clock;
use crate::types::{ActiveFace, CheckinEvent, Pose};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Maximum number of check-ins kept in the live snapshot.
pub const MAX_RECENT_CHECKINS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub people_count: u32,
    pub active_faces: Vec<ActiveFace>,
    pub latest_poses: Vec<Pose>,
    /// Most recent check-ins, newest first.
    pub checkins: Vec<CheckinEvent>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_update: DateTime<Utc>,
}

impl StateSnapshot {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            people_count: 0,
            active_faces: Vec::new(),
            latest_poses: Vec::new(),
            checkins: Vec::new(),
            last_update: now,
        }
    }
}

/// Single writer for the process-wide snapshot.
pub struct StateAggregator {
    shared: Arc<RwLock<StateSnapshot>>,
    clock: Arc<dyn Clock>,
}

impl StateAggregator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let shared = Arc::new(RwLock::new(StateSnapshot::empty(clock.now())));
        Self { shared, clock }
    }

    /// Read-only handle for observers and query handlers.
    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.reader().snapshot()
    }

    /// Replace the active faces with the latest batch.
    pub fn apply_face_batch(&mut self, active_faces: Vec<ActiveFace>) {
        self.update(|state| state.active_faces = active_faces);
    }

    pub fn apply_pose(&mut self, poses: Vec<Pose>) {
        self.update(|state| state.latest_poses = poses);
    }

    pub fn apply_count(&mut self, count: u32) {
        self.update(|state| state.people_count = count);
    }

    /// Insert a check-in keeping the list newest-first, then truncate to
    /// [`MAX_RECENT_CHECKINS`]. In the normal case the event is the newest
    /// and lands at the front.
    pub fn record_checkin(&mut self, event: CheckinEvent) {
        self.update(|state| {
            let pos = state
                .checkins
                .iter()
                .position(|existing| existing.occurred_at <= event.occurred_at)
                .unwrap_or(state.checkins.len());
            state.checkins.insert(pos, event);
            state.checkins.truncate(MAX_RECENT_CHECKINS);
        });
    }

    fn update(&mut self, apply: impl FnOnce(&mut StateSnapshot)) {
        let now = self.clock.now();
        let mut state = self.shared.write().unwrap_or_else(|e| e.into_inner());
        apply(&mut state);
        state.last_update = now;
    }
}

/// Cloneable read-only view of the live snapshot.
#[derive(Clone)]
pub struct SnapshotReader {
    shared: Arc<RwLock<StateSnapshot>>,
}

impl SnapshotReader {
    /// Owned, consistent copy of the current state.
    pub fn snapshot(&self) -> StateSnapshot {
        self.shared
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn people_count(&self) -> u32 {
        self.shared
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .people_count
    }
}
