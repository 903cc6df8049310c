//! Pipeline orchestrator: the single consumer of decoded sensor events.
//!
//! Runs on one task and owns the state aggregator and the deduplicator,
//! so every dedup decision and snapshot write happens in order. Matcher
//! calls for one face batch run concurrently; everything after matching
//! is sequential in detection order.

use crate::broadcast::{BroadcastHub, ObserverEvent};
use crate::transport::Publisher;
use futures::future::join_all;
use noel_core::{
    ActiveFace, CheckinEvent, Clock, Deduplicator, Detection, IdentityMatcher, InboundEvent,
    MatchError, MatchResult, Pose, StateAggregator,
};
use chrono::{DateTime, Utc};
use noel_store::{CheckinStore, RecordId, StorageError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("identity match failed: {0}")]
    Match(#[from] MatchError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StorageError),
}

/// Running totals exposed through the stats endpoint.
#[derive(Debug, Default)]
pub struct Counters {
    batches: AtomicU64,
    detections_matched: AtomicU64,
    match_failures: AtomicU64,
    checkins_recorded: AtomicU64,
    checkins_suppressed: AtomicU64,
    persistence_failures: AtomicU64,
    decode_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub batches: u64,
    pub detections_matched: u64,
    pub match_failures: u64,
    pub checkins_recorded: u64,
    pub checkins_suppressed: u64,
    pub persistence_failures: u64,
    pub decode_failures: u64,
}

impl Counters {
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            batches: get(&self.batches),
            detections_matched: get(&self.detections_matched),
            match_failures: get(&self.match_failures),
            checkins_recorded: get(&self.checkins_recorded),
            checkins_suppressed: get(&self.checkins_suppressed),
            persistence_failures: get(&self.persistence_failures),
            decode_failures: get(&self.decode_failures),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Terminal state of one detection.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    Unmatched,
    Suppressed { identity_id: String },
    Recorded(CheckinEvent),
}

struct CheckinAcks {
    publisher: Arc<dyn Publisher>,
    topic: String,
}

pub struct Pipeline {
    matcher: Arc<dyn IdentityMatcher>,
    store: Arc<dyn CheckinStore>,
    hub: Arc<BroadcastHub>,
    aggregator: StateAggregator,
    dedup: Deduplicator,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    acks: Option<CheckinAcks>,
}

impl Pipeline {
    pub fn new(
        matcher: Arc<dyn IdentityMatcher>,
        store: Arc<dyn CheckinStore>,
        hub: Arc<BroadcastHub>,
        aggregator: StateAggregator,
        clock: Arc<dyn Clock>,
        counters: Arc<Counters>,
        dedup_window_ms: u64,
    ) -> Self {
        Self {
            matcher,
            store,
            hub,
            aggregator,
            dedup: Deduplicator::new(dedup_window_ms),
            clock,
            counters,
            acks: None,
        }
    }

    /// Also publish every recorded check-in to `topic` on the edge transport.
    pub fn with_checkin_acks(mut self, publisher: Arc<dyn Publisher>, topic: String) -> Self {
        self.acks = Some(CheckinAcks { publisher, topic });
        self
    }

    /// Seed the deduplicator from check-ins persisted within the last
    /// window so a restart does not re-admit someone just seen.
    pub async fn restore_dedup(&mut self) -> Result<usize, PipelineError> {
        let now = self.clock.now();
        let since = now
            .checked_sub_signed(self.dedup.window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let recent = self.store.latest_checkins_since(since).await?;
        for (identity_id, at) in &recent {
            self.dedup.seed(identity_id, *at);
        }
        tracing::info!(identities = recent.len(), "dedup window restored from store");
        Ok(recent.len())
    }

    /// Consume events until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<InboundEvent>) {
        tracing::info!("pipeline started");
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        tracing::info!(counters = ?self.counters.snapshot(), "pipeline drained");
    }

    pub async fn handle(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Face(detections) => {
                self.process_face_batch(detections).await;
            }
            InboundEvent::Pose(poses) => self.process_poses(poses),
            InboundEvent::Count(count) => self.process_count(count),
        }
    }

    fn process_poses(&mut self, poses: Vec<Pose>) {
        tracing::debug!(poses = poses.len(), "pose update");
        let aggregator = &mut self.aggregator;
        let latest = poses.clone();
        self.hub
            .broadcast(ObserverEvent::Pose(poses), || aggregator.apply_pose(latest));
    }

    fn process_count(&mut self, count: u32) {
        tracing::debug!(count, "people count update");
        let aggregator = &mut self.aggregator;
        self.hub
            .broadcast(ObserverEvent::Count(count), || aggregator.apply_count(count));
    }

    /// Match every detection, then run dedup and recording in batch order.
    /// A failure on one detection never affects the others.
    pub async fn process_face_batch(&mut self, detections: Vec<Detection>) -> Vec<DetectionOutcome> {
        Counters::bump(&self.counters.batches);
        let pruned = self.dedup.prune(self.clock.now());
        if pruned > 0 {
            tracing::trace!(pruned, "expired dedup entries");
        }

        let matches = join_all(detections.iter().map(|d| self.resolve(d))).await;

        let mut outcomes = Vec::with_capacity(detections.len());
        let mut active_faces = Vec::with_capacity(detections.len());
        for (index, (detection, matched)) in detections.iter().zip(matches).enumerate() {
            let matched = match matched {
                Ok(matched) => matched,
                Err(e) => {
                    Counters::bump(&self.counters.match_failures);
                    tracing::warn!(detection = index, error = %e, "treating detection as unmatched");
                    None
                }
            };
            active_faces.push(ActiveFace::from_detection(detection, matched.as_ref()));

            let outcome = match matched {
                None => DetectionOutcome::Unmatched,
                Some(matched) => self.admit(matched).await,
            };
            outcomes.push(outcome);
        }

        self.aggregator.apply_face_batch(active_faces);
        tracing::debug!(
            detections = detections.len(),
            recorded = outcomes
                .iter()
                .filter(|o| matches!(o, DetectionOutcome::Recorded(_)))
                .count(),
            "face batch processed"
        );
        outcomes
    }

    async fn resolve(&self, detection: &Detection) -> Result<Option<MatchResult>, PipelineError> {
        Ok(self.matcher.find_match(&detection.embedding).await?)
    }

    async fn admit(&mut self, matched: MatchResult) -> DetectionOutcome {
        Counters::bump(&self.counters.detections_matched);
        let now = self.clock.now();
        if !self.dedup.should_accept(&matched.identity_id, now) {
            Counters::bump(&self.counters.checkins_suppressed);
            tracing::debug!(identity = %matched.identity_id, "suppressed by dedup window");
            return DetectionOutcome::Suppressed {
                identity_id: matched.identity_id,
            };
        }

        let event = CheckinEvent::from_match(&matched, now);
        self.record(event.clone()).await;
        DetectionOutcome::Recorded(event)
    }

    /// Snapshot and observers together, then the durable append. A failed
    /// append is logged and counted; the check-in stays visible.
    async fn record(&mut self, event: CheckinEvent) {
        let aggregator = &mut self.aggregator;
        let recorded = event.clone();
        self.hub.broadcast(ObserverEvent::Checkin(event.clone()), || {
            aggregator.record_checkin(recorded)
        });
        Counters::bump(&self.counters.checkins_recorded);

        match self.persist(&event).await {
            Ok(id) => tracing::info!(
                identity = %event.identity_id,
                name = %event.display_name,
                similarity = event.similarity,
                record = %id,
                "check-in recorded"
            ),
            Err(e) => {
                Counters::bump(&self.counters.persistence_failures);
                tracing::error!(
                    identity = %event.identity_id,
                    error = %e,
                    "check-in not persisted; kept in live state only"
                );
            }
        }

        self.acknowledge(&event);
    }

    async fn persist(&self, event: &CheckinEvent) -> Result<RecordId, PipelineError> {
        Ok(self.store.append_checkin(event).await?)
    }

    fn acknowledge(&self, event: &CheckinEvent) {
        let Some(acks) = &self.acks else {
            return;
        };
        match serde_json::to_vec(event) {
            Ok(payload) => {
                if !acks.publisher.publish(&acks.topic, &payload) {
                    tracing::debug!(topic = %acks.topic, "check-in ack not sent");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode check-in ack"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use noel_core::{Embedding, ManualClock};
    use noel_store::{SqliteStore, StoredCheckin};
    use std::sync::Mutex;

    /// Resolves by the first embedding component: `1.0` is U1, `2.0` is
    /// U2, a NaN errors, anything else is unknown.
    struct FakeMatcher;

    #[async_trait]
    impl IdentityMatcher for FakeMatcher {
        async fn find_match(&self, embedding: &Embedding) -> Result<Option<MatchResult>, MatchError> {
            let first = embedding.values.first().copied().unwrap_or_default();
            if first.is_nan() {
                return Err(MatchError::MalformedEmbedding("nan".into()));
            }
            let (id, similarity) = match first as i32 {
                1 => ("U1", 0.92),
                2 => ("U2", 0.75),
                _ => return Ok(None),
            };
            Ok(Some(MatchResult {
                identity_id: id.into(),
                display_name: format!("Guest {id}"),
                avatar_ref: format!("{id}.png"),
                similarity,
            }))
        }
    }

    struct FailingStore;

    #[async_trait]
    impl CheckinStore for FailingStore {
        async fn append_checkin(&self, _: &CheckinEvent) -> Result<RecordId, StorageError> {
            Err(StorageError::InvalidInput("disk full".into()))
        }
        async fn recent_checkins(&self, _: usize) -> Result<Vec<StoredCheckin>, StorageError> {
            Err(StorageError::InvalidInput("disk full".into()))
        }
        async fn count_checkins(&self) -> Result<u64, StorageError> {
            Err(StorageError::InvalidInput("disk full".into()))
        }
        async fn latest_checkins_since(
            &self,
            _: DateTime<Utc>,
        ) -> Result<Vec<(String, DateTime<Utc>)>, StorageError> {
            Err(StorageError::InvalidInput("disk full".into()))
        }
    }

    /// Parks every append until released.
    #[derive(Default)]
    struct SlowStore {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl CheckinStore for SlowStore {
        async fn append_checkin(&self, _: &CheckinEvent) -> Result<RecordId, StorageError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(RecordId(1))
        }
        async fn recent_checkins(&self, _: usize) -> Result<Vec<StoredCheckin>, StorageError> {
            Ok(Vec::new())
        }
        async fn count_checkins(&self) -> Result<u64, StorageError> {
            Ok(0)
        }
        async fn latest_checkins_since(
            &self,
            _: DateTime<Utc>,
        ) -> Result<Vec<(String, DateTime<Utc>)>, StorageError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, topic: &str, payload: &[u8]) -> bool {
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
            true
        }
    }

    struct Harness {
        pipeline: Pipeline,
        clock: Arc<ManualClock>,
        hub: Arc<BroadcastHub>,
        counters: Arc<Counters>,
        reader: noel_core::SnapshotReader,
    }

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn harness(store: Arc<dyn CheckinStore>) -> Harness {
        harness_with_window(store, 30_000)
    }

    fn harness_with_window(store: Arc<dyn CheckinStore>, window_ms: u64) -> Harness {
        let clock = Arc::new(ManualClock::new(start()));
        let aggregator = StateAggregator::new(clock.clone());
        let reader = aggregator.reader();
        let hub = Arc::new(BroadcastHub::new(reader.clone(), 64));
        let counters = Arc::new(Counters::default());
        let pipeline = Pipeline::new(
            Arc::new(FakeMatcher),
            store,
            hub.clone(),
            aggregator,
            clock.clone(),
            counters.clone(),
            window_ms,
        );
        Harness { pipeline, clock, hub, counters, reader }
    }

    async fn sqlite() -> Arc<SqliteStore> {
        Arc::new(SqliteStore::open_in_memory().await.unwrap())
    }

    fn face(first: f32) -> Detection {
        Detection {
            embedding: Embedding::new(vec![first, 0.5, 0.5]),
            bbox: Some([10.0, 20.0, 110.0, 140.0]),
            confidence: Some(0.98),
        }
    }

    fn next_json(sub: &mut crate::broadcast::ObserverSubscription) -> serde_json::Value {
        let msg = sub.rx.try_recv().expect("observer message queued");
        serde_json::from_str(&msg).unwrap()
    }

    #[tokio::test]
    async fn test_first_sighting_records_persists_and_broadcasts() {
        let store = sqlite().await;
        let mut h = harness(store.clone());
        let mut sub = h.hub.connect_observer();

        let outcomes = h.pipeline.process_face_batch(vec![face(1.0)]).await;
        assert_eq!(outcomes.len(), 1);
        let DetectionOutcome::Recorded(event) = &outcomes[0] else {
            panic!("expected a check-in, got {:?}", outcomes[0]);
        };
        assert_eq!(event.identity_id, "U1");
        assert!((event.similarity - 0.92).abs() < 1e-6);
        assert_eq!(event.occurred_at, start());

        let snap = h.reader.snapshot();
        assert_eq!(snap.checkins.len(), 1);
        assert_eq!(snap.checkins[0].identity_id, "U1");
        assert_eq!(store.count_checkins().await.unwrap(), 1);

        assert_eq!(next_json(&mut sub)["type"], "state");
        let checkin = next_json(&mut sub);
        assert_eq!(checkin["type"], "checkin");
        assert_eq!(checkin["data"]["identityId"], "U1");
        assert_eq!(checkin["data"]["occurredAt"], 1_700_000_000_000i64);
    }

    #[tokio::test]
    async fn test_repeat_suppressed_inside_window_then_accepted_after() {
        let store = sqlite().await;
        let mut h = harness(store.clone());

        h.pipeline.process_face_batch(vec![face(1.0)]).await;
        h.clock.advance_ms(5_000);
        let outcomes = h.pipeline.process_face_batch(vec![face(1.0)]).await;
        assert_eq!(
            outcomes,
            vec![DetectionOutcome::Suppressed { identity_id: "U1".into() }]
        );

        h.clock.advance_ms(26_000);
        let outcomes = h.pipeline.process_face_batch(vec![face(1.0)]).await;
        assert!(matches!(outcomes[0], DetectionOutcome::Recorded(_)));

        let snap = h.reader.snapshot();
        assert_eq!(snap.checkins.len(), 2);
        let gap = snap.checkins[0].occurred_at - snap.checkins[1].occurred_at;
        assert_eq!(gap.num_milliseconds(), 31_000);
        assert_eq!(store.count_checkins().await.unwrap(), 2);
        assert_eq!(h.counters.snapshot().checkins_suppressed, 1);
    }

    #[tokio::test]
    async fn test_same_identity_twice_in_one_batch_yields_one_checkin() {
        let mut h = harness(sqlite().await);
        let outcomes = h
            .pipeline
            .process_face_batch(vec![face(1.0), face(2.0), face(1.0)])
            .await;
        assert!(matches!(outcomes[0], DetectionOutcome::Recorded(_)));
        assert!(matches!(outcomes[1], DetectionOutcome::Recorded(_)));
        assert_eq!(
            outcomes[2],
            DetectionOutcome::Suppressed { identity_id: "U1".into() }
        );
        assert_eq!(h.reader.snapshot().checkins.len(), 2);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_checkin_visible() {
        let mut h = harness(Arc::new(FailingStore));
        let mut sub = h.hub.connect_observer();

        let outcomes = h.pipeline.process_face_batch(vec![face(1.0)]).await;
        assert!(matches!(outcomes[0], DetectionOutcome::Recorded(_)));
        assert_eq!(h.reader.snapshot().checkins.len(), 1);

        next_json(&mut sub);
        assert_eq!(next_json(&mut sub)["type"], "checkin");
        let counters = h.counters.snapshot();
        assert_eq!(counters.persistence_failures, 1);
        assert_eq!(counters.checkins_recorded, 1);
    }

    #[tokio::test]
    async fn test_match_error_is_contained_to_its_detection() {
        let mut h = harness(sqlite().await);
        let outcomes = h
            .pipeline
            .process_face_batch(vec![face(f32::NAN), face(7.0), face(2.0)])
            .await;
        assert_eq!(outcomes[0], DetectionOutcome::Unmatched);
        assert_eq!(outcomes[1], DetectionOutcome::Unmatched);
        assert!(matches!(outcomes[2], DetectionOutcome::Recorded(_)));

        let counters = h.counters.snapshot();
        assert_eq!(counters.match_failures, 1);
        assert_eq!(counters.detections_matched, 1);
        assert_eq!(counters.batches, 1);
    }

    #[tokio::test]
    async fn test_active_faces_replaced_per_batch_and_enriched() {
        let mut h = harness(sqlite().await);
        h.pipeline.process_face_batch(vec![face(1.0), face(9.0)]).await;
        let faces = h.reader.snapshot().active_faces;
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].identity_id.as_deref(), Some("U1"));
        assert_eq!(faces[0].display_name.as_deref(), Some("Guest U1"));
        assert_eq!(faces[0].bbox, Some([10.0, 20.0, 110.0, 140.0]));
        assert_eq!(faces[1].identity_id, None);

        h.pipeline.process_face_batch(Vec::new()).await;
        assert!(h.reader.snapshot().active_faces.is_empty());
    }

    #[tokio::test]
    async fn test_count_message_sets_count_and_broadcasts() {
        let mut h = harness(sqlite().await);
        let mut sub = h.hub.connect_observer();
        h.pipeline.handle(InboundEvent::Count(7)).await;

        assert_eq!(h.reader.snapshot().people_count, 7);
        next_json(&mut sub);
        assert_eq!(
            next_json(&mut sub),
            serde_json::json!({"type": "count", "data": 7})
        );
    }

    #[tokio::test]
    async fn test_pose_message_replaces_poses_and_broadcasts() {
        let mut h = harness(sqlite().await);
        let mut sub = h.hub.connect_observer();
        let pose = Pose { keypoints: vec![[1.0, 2.0, 0.5]], confidence: 0.8 };
        h.pipeline.handle(InboundEvent::Pose(vec![pose.clone()])).await;

        assert_eq!(h.reader.snapshot().latest_poses, vec![pose]);
        next_json(&mut sub);
        let msg = next_json(&mut sub);
        assert_eq!(msg["type"], "pose");
        assert_eq!(msg["data"][0]["keypoints"][0][1], 2.0);
    }

    #[tokio::test]
    async fn test_restore_dedup_suppresses_recent_history() {
        let store = sqlite().await;
        store
            .append_checkin(&CheckinEvent {
                identity_id: "U1".into(),
                display_name: "Guest U1".into(),
                avatar_ref: String::new(),
                occurred_at: start() - chrono::Duration::seconds(10),
                similarity: 0.9,
            })
            .await
            .unwrap();
        let mut h = harness(store);
        assert_eq!(h.pipeline.restore_dedup().await.unwrap(), 1);

        let outcomes = h.pipeline.process_face_batch(vec![face(1.0)]).await;
        assert!(matches!(outcomes[0], DetectionOutcome::Suppressed { .. }));
        h.clock.advance_ms(20_000);
        let outcomes = h.pipeline.process_face_batch(vec![face(1.0)]).await;
        assert!(matches!(outcomes[0], DetectionOutcome::Recorded(_)));
    }

    #[tokio::test]
    async fn test_restore_dedup_surfaces_store_error() {
        let mut h = harness(Arc::new(FailingStore));
        let err = h.pipeline.restore_dedup().await.unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_checkin_ack_published_to_edge() {
        let publisher = Arc::new(RecordingPublisher::default());
        let h = harness(sqlite().await);
        let mut pipeline = h
            .pipeline
            .with_checkin_acks(publisher.clone(), "smartnoel/checkin".into());
        pipeline.process_face_batch(vec![face(2.0)]).await;

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "smartnoel/checkin");
        let body: serde_json::Value = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(body["identityId"], "U2");
    }

    #[tokio::test]
    async fn test_run_drains_queue_in_order_and_survives_bad_batches() {
        let h = harness(sqlite().await);
        let reader = h.reader.clone();
        let (tx, rx) = mpsc::channel(8);
        tx.send(InboundEvent::Count(2)).await.unwrap();
        tx.send(InboundEvent::Face(vec![face(f32::NAN)])).await.unwrap();
        tx.send(InboundEvent::Face(vec![face(1.0)])).await.unwrap();
        tx.send(InboundEvent::Count(4)).await.unwrap();
        drop(tx);

        h.pipeline.run(rx).await;
        let snap = reader.snapshot();
        assert_eq!(snap.people_count, 4);
        assert_eq!(snap.checkins.len(), 1);
        assert_eq!(h.counters.snapshot().batches, 2);
    }

    #[tokio::test]
    async fn test_observer_joining_during_append_sees_checkin_once() {
        let store = Arc::new(SlowStore::default());
        let h = harness(store.clone());
        let mut pipeline = h.pipeline;
        let batch = tokio::spawn(async move {
            pipeline.process_face_batch(vec![face(1.0)]).await
        });

        store.entered.notified().await;
        let mut sub = h.hub.connect_observer();
        store.release.notify_one();
        let outcomes = batch.await.unwrap();
        assert!(matches!(outcomes[0], DetectionOutcome::Recorded(_)));

        let baseline = next_json(&mut sub);
        assert_eq!(baseline["type"], "state");
        assert_eq!(baseline["data"]["checkins"][0]["identityId"], "U1");
        assert!(sub.rx.try_recv().is_err(), "no checkin delta after a baseline that has it");
    }

    #[tokio::test]
    async fn test_restore_dedup_with_oversized_window() {
        let store = sqlite().await;
        store
            .append_checkin(&CheckinEvent {
                identity_id: "U1".into(),
                display_name: "Guest U1".into(),
                avatar_ref: String::new(),
                occurred_at: start() - chrono::Duration::days(400),
                similarity: 0.9,
            })
            .await
            .unwrap();
        let mut h = harness_with_window(store, u64::MAX);
        assert_eq!(h.pipeline.restore_dedup().await.unwrap(), 1);

        let outcomes = h.pipeline.process_face_batch(vec![face(1.0)]).await;
        assert!(matches!(outcomes[0], DetectionOutcome::Suppressed { .. }));
    }
}
