//! noel-store: Durable storage for check-ins and the identity registry.
//!
//! Check-ins are append-only. The registry holds enrolled identities and
//! the embedding each one was enrolled with.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use noel_core::{CheckinEvent, Embedding, Identity};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

pub use sqlite::SqliteStore;

/// Default database location: `$XDG_DATA_HOME/noel/noel.db`, falling back
/// to `~/.local/share/noel/noel.db`.
pub fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("noel")
        .join("noel.db")
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("corrupt record {table}/{id}: {reason}")]
    Corrupt {
        table: &'static str,
        id: String,
        reason: String,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Row id assigned to an appended check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted check-in together with its record id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredCheckin {
    pub id: RecordId,
    #[serde(flatten)]
    pub event: CheckinEvent,
}

/// Registration request for a new identity.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub display_name: String,
    pub avatar_ref: String,
    pub embedding: Embedding,
}

/// Append-only check-in history.
#[async_trait]
pub trait CheckinStore: Send + Sync {
    async fn append_checkin(&self, event: &CheckinEvent) -> Result<RecordId, StorageError>;

    /// Most recent `limit` check-ins, newest first.
    async fn recent_checkins(&self, limit: usize) -> Result<Vec<StoredCheckin>, StorageError>;

    async fn count_checkins(&self) -> Result<u64, StorageError>;

    /// Latest check-in per identity at or after `since`.
    async fn latest_checkins_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StorageError>;
}

/// Enrolled identities.
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
    async fn register_identity(&self, new: NewIdentity) -> Result<Identity, StorageError>;

    async fn list_identities(&self) -> Result<Vec<Identity>, StorageError>;

    /// Returns `false` when no identity had that id.
    async fn remove_identity(&self, id: &str) -> Result<bool, StorageError>;

    async fn count_identities(&self) -> Result<u64, StorageError>;
}
