//! Fan-out of pipeline updates to live observers.
//!
//! Each observer owns a bounded queue. Broadcasting never waits: a full
//! queue drops that one message for that one observer, a closed queue
//! unregisters the observer. A new observer's queue is seeded with the
//! full snapshot before it becomes visible to `broadcast`, so nothing
//! incremental can overtake the baseline.

use noel_core::{CheckinEvent, Pose, SnapshotReader, StateSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Outbound observer message, serialized as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ObserverEvent {
    State(StateSnapshot),
    Checkin(CheckinEvent),
    Pose(Vec<Pose>),
    Count(u32),
}

impl ObserverEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::State(_) => "state",
            Self::Checkin(_) => "checkin",
            Self::Pose(_) => "pose",
            Self::Count(_) => "count",
        }
    }

    fn encode(&self) -> Option<Arc<str>> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Arc::from(json)),
            Err(e) => {
                tracing::error!(kind = self.kind(), error = %e, "failed to encode observer event");
                None
            }
        }
    }
}

/// Receiving side handed to a newly connected observer.
pub struct ObserverSubscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<Arc<str>>,
}

pub struct BroadcastHub {
    observers: Mutex<HashMap<Uuid, mpsc::Sender<Arc<str>>>>,
    reader: SnapshotReader,
    buffer: usize,
    dropped: AtomicU64,
}

impl BroadcastHub {
    pub fn new(reader: SnapshotReader, buffer: usize) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            reader,
            buffer: buffer.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register an observer. The first message in its queue is always the
    /// full current snapshot.
    pub fn connect_observer(&self) -> ObserverSubscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        // Taken under the hub lock: no broadcast can slip in between the
        // snapshot and the registration.
        if let Some(baseline) = ObserverEvent::State(self.reader.snapshot()).encode() {
            // Fresh queue with capacity >= 1; cannot be full.
            let _ = tx.try_send(baseline);
        }
        observers.insert(id, tx);
        let total = observers.len();
        drop(observers);

        tracing::info!(observer = %id, total, "observer connected");
        ObserverSubscription { id, rx }
    }

    pub fn disconnect_observer(&self, id: &Uuid) {
        let removed = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some();
        if removed {
            tracing::info!(observer = %id, "observer disconnected");
        }
    }

    /// Run the snapshot mutation `apply`, then queue `event` for every
    /// connected observer without waiting. Both happen under the hub lock,
    /// so a concurrently connecting observer gets either the old snapshot
    /// followed by the delta, or the new snapshot and no delta.
    pub fn broadcast(&self, event: ObserverEvent, apply: impl FnOnce()) {
        let message = event.encode();
        let kind = event.kind();

        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        apply();
        let Some(message) = message else {
            return;
        };
        observers.retain(|id, tx| match tx.try_send(Arc::clone(&message)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(observer = %id, kind, "observer queue full; dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::info!(observer = %id, "observer gone; unregistering");
                false
            }
        });
        tracing::trace!(kind, observers = observers.len(), "broadcast");
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Messages discarded because an observer's queue was full.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drop every observer queue so their connection tasks finish.
    pub fn close_all(&self) {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let count = observers.len();
        observers.clear();
        if count > 0 {
            tracing::info!(observers = count, "closed all observers");
        }
    }
}
