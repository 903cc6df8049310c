//! noel-core: Check-in domain model.
//!
//! Holds the pieces of the ingestion pipeline that carry real state:
//! identity matching against an enrolled gallery, the per-identity
//! dedup window, and the live snapshot observers read from.

pub mod clock;
pub mod dedup;
pub mod matcher;
pub mod payload;
pub mod state;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dedup::{Deduplicator, DEFAULT_DEDUP_WINDOW_MS};
pub use matcher::{best_match, IdentityMatcher, MatchError};
pub use payload::{decode_payload, DecodeError, InboundEvent, TopicKind};
pub use state::{SnapshotReader, StateAggregator, StateSnapshot, MAX_RECENT_CHECKINS};
pub use types::{ActiveFace, CheckinEvent, Detection, Embedding, Identity, MatchResult, Pose};
