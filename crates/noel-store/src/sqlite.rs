//! SQLite-backed store via `tokio-rusqlite`.
//!
//! All statements run on the connection's background thread; callers
//! only ever await.

use crate::{CheckinStore, IdentityRegistry, NewIdentity, RecordId, StorageError, StoredCheckin};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use noel_core::{CheckinEvent, Embedding, Identity};
use rusqlite::params;
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS checkins (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  identity_id TEXT NOT NULL,
  display_name TEXT NOT NULL,
  avatar_ref TEXT NOT NULL,
  occurred_at INTEGER NOT NULL,
  similarity REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_checkins_occurred ON checkins(occurred_at);
CREATE INDEX IF NOT EXISTS idx_checkins_identity ON checkins(identity_id, occurred_at);

CREATE TABLE IF NOT EXISTS identities (
  id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  avatar_ref TEXT NOT NULL,
  embedding TEXT NOT NULL,
  registered_at INTEGER NOT NULL
);
"#;

type CheckinRow = (i64, String, String, String, i64, f64);
type IdentityRow = (String, String, String, String, i64);

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database file and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::InvalidInput(format!("{}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(&path).await?;
        let store = Self { conn };
        store.ensure_schema().await?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn from_millis(table: &'static str, id: &str, ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StorageError::Corrupt {
        table,
        id: id.to_string(),
        reason: format!("timestamp {ms} out of range"),
    })
}

fn checkin_from_row(row: CheckinRow) -> Result<StoredCheckin, StorageError> {
    let (id, identity_id, display_name, avatar_ref, occurred_ms, similarity) = row;
    Ok(StoredCheckin {
        id: RecordId(id),
        event: CheckinEvent {
            occurred_at: from_millis("checkins", &id.to_string(), occurred_ms)?,
            identity_id,
            display_name,
            avatar_ref,
            similarity: similarity as f32,
        },
    })
}

fn identity_from_row(row: IdentityRow) -> Result<Identity, StorageError> {
    let (id, display_name, avatar_ref, embedding_json, registered_ms) = row;
    let values: Vec<f32> =
        serde_json::from_str(&embedding_json).map_err(|e| StorageError::Corrupt {
            table: "identities",
            id: id.clone(),
            reason: format!("embedding: {e}"),
        })?;
    Ok(Identity {
        registered_at: from_millis("identities", &id, registered_ms)?,
        id,
        display_name,
        avatar_ref,
        embedding: Embedding::new(values),
    })
}

#[async_trait]
impl CheckinStore for SqliteStore {
    async fn append_checkin(&self, event: &CheckinEvent) -> Result<RecordId, StorageError> {
        let event = event.clone();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO checkins (identity_id, display_name, avatar_ref, occurred_at, similarity)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        event.identity_id,
                        event.display_name,
                        event.avatar_ref,
                        event.occurred_at.timestamp_millis(),
                        event.similarity as f64,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(RecordId(id))
    }

    async fn recent_checkins(&self, limit: usize) -> Result<Vec<StoredCheckin>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<CheckinRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity_id, display_name, avatar_ref, occurred_at, similarity
                     FROM checkins ORDER BY occurred_at DESC, id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(checkin_from_row).collect()
    }

    async fn count_checkins(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM checkins", [], |row| row.get(0))?))
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn latest_checkins_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StorageError> {
        let since_ms = since.timestamp_millis();
        let rows: Vec<(String, i64)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity_id, MAX(occurred_at) FROM checkins
                     WHERE occurred_at >= ?1 GROUP BY identity_id",
                )?;
                let rows = stmt
                    .query_map(params![since_ms], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter()
            .map(|(id, ms)| {
                let at = from_millis("checkins", &id, ms)?;
                Ok((id, at))
            })
            .collect()
    }
}

#[async_trait]
impl IdentityRegistry for SqliteStore {
    async fn register_identity(&self, new: NewIdentity) -> Result<Identity, StorageError> {
        if new.display_name.trim().is_empty() {
            return Err(StorageError::InvalidInput("display name is empty".into()));
        }
        if !new.embedding.is_well_formed() {
            return Err(StorageError::InvalidInput(
                "embedding is empty or has non-finite components".into(),
            ));
        }
        let embedding_json = serde_json::to_string(&new.embedding.values)
            .map_err(|e| StorageError::InvalidInput(format!("embedding: {e}")))?;

        let identity = Identity {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: new.display_name.trim().to_string(),
            avatar_ref: new.avatar_ref,
            embedding: new.embedding,
            registered_at: Utc::now(),
        };
        let row = (
            identity.id.clone(),
            identity.display_name.clone(),
            identity.avatar_ref.clone(),
            identity.registered_at.timestamp_millis(),
        );
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identities (id, display_name, avatar_ref, embedding, registered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![row.0, row.1, row.2, embedding_json, row.3],
                )?;
                Ok(())
            })
            .await?;
        tracing::info!(identity = %identity.id, name = %identity.display_name, "identity registered");
        Ok(identity)
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, StorageError> {
        let rows: Vec<IdentityRow> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, display_name, avatar_ref, embedding, registered_at
                     FROM identities ORDER BY registered_at ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(identity_from_row).collect()
    }

    async fn remove_identity(&self, id: &str) -> Result<bool, StorageError> {
        let id = id.to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM identities WHERE id = ?1", params![id])?))
            .await?;
        Ok(removed > 0)
    }

    async fn count_identities(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?))
            .await?;
        Ok(count.max(0) as u64)
    }
}
