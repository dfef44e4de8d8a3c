//! Durable submission queue backed by SQLite.
//!
//! Queued submissions survive process restarts. A record is written exactly
//! once (idempotent upsert), replayed by the sync engine, and deleted only
//! after the endpoint confirms delivery. Records are never mutated in place.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// A durably stored unit of deferred work: one captured submission.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSubmission {
  /// Primary key, `survey_<millis>_<hex8>`.
  pub id: String,
  pub url: String,
  pub method: String,
  /// Header snapshot taken at capture time, not live.
  pub headers: HashMap<String, String>,
  /// Exact serialized payload, captured before any network attempt.
  pub body: String,
  pub timestamp: DateTime<Utc>,
}

impl QueuedSubmission {
  /// Build a submission record from a captured request.
  ///
  /// The id suffix is a hash of the payload, so capturing the same
  /// submission twice in the same millisecond produces the same id and the
  /// upsert replaces instead of duplicating.
  pub fn new(
    url: impl Into<String>,
    method: impl Into<String>,
    headers: HashMap<String, String>,
    body: impl Into<String>,
  ) -> Self {
    let url = url.into();
    let body = body.into();
    let timestamp = Utc::now();

    let mut hasher = Sha256::new();
    hasher.update(timestamp.timestamp_millis().to_le_bytes());
    hasher.update(url.as_bytes());
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();
    let id = format!(
      "survey_{}_{}",
      timestamp.timestamp_millis(),
      &hex::encode(digest)[..8]
    );

    Self {
      id,
      url,
      method: method.into(),
      headers,
      body,
      timestamp,
    }
  }

  /// A record that lost its routing fields is malformed: it is skipped by
  /// the drain but never deleted, so it stays inspectable.
  pub fn is_malformed(&self) -> bool {
    self.url.is_empty() || self.method.is_empty()
  }
}

/// Queue summary entry: identity and age only, never the payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PendingSurvey {
  pub id: String,
  pub timestamp: DateTime<Utc>,
}

/// Trait for durable queue backends.
pub trait QueueStore: Send + Sync {
  /// Insert or replace a submission by id.
  fn upsert(&self, submission: &QueuedSubmission) -> Result<()>;

  /// All queued submissions in capture order.
  fn list_all(&self) -> Result<Vec<QueuedSubmission>>;

  /// Queue summaries in capture order (id + timestamp only).
  fn summaries(&self) -> Result<Vec<PendingSurvey>>;

  /// Delete a submission by id. Deleting a missing id is not an error.
  fn delete(&self, id: &str) -> Result<()>;

  /// Number of queued submissions.
  fn count(&self) -> Result<usize>;
}

/// SQLite-backed queue store.
pub struct SqliteQueueStore {
  conn: Mutex<Connection>,
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_queue (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT NOT NULL,
    queued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_queued_at ON sync_queue(queued_at);
"#;

impl SqliteQueueStore {
  /// Open or create the queue database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// In-memory store, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory queue: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(())
  }
}

impl QueueStore for SqliteQueueStore {
  fn upsert(&self, submission: &QueuedSubmission) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_string(&submission.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO sync_queue (id, url, method, headers, body, queued_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          submission.id,
          submission.url,
          submission.method,
          headers,
          submission.body,
          submission.timestamp.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store submission {}: {}", submission.id, e))?;

    Ok(())
  }

  fn list_all(&self) -> Result<Vec<QueuedSubmission>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, queued_at FROM sync_queue ORDER BY queued_at",
      )
      .map_err(|e| eyre!("Failed to prepare queue listing: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, String>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list queue: {}", e))?;

    let mut submissions = Vec::new();
    for row in rows {
      let (id, url, method, headers, body, queued_at) =
        row.map_err(|e| eyre!("Failed to read queue row: {}", e))?;

      // A row whose headers column no longer decodes is still replayable;
      // the snapshot degrades to no extra headers.
      let headers: HashMap<String, String> = serde_json::from_str(&headers).unwrap_or_default();

      submissions.push(QueuedSubmission {
        id,
        url,
        method,
        headers,
        body,
        timestamp: parse_timestamp(&queued_at)?,
      });
    }

    Ok(submissions)
  }

  fn summaries(&self) -> Result<Vec<PendingSurvey>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT id, queued_at FROM sync_queue ORDER BY queued_at")
      .map_err(|e| eyre!("Failed to prepare queue summary: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })
      .map_err(|e| eyre!("Failed to summarize queue: {}", e))?;

    let mut summaries = Vec::new();
    for row in rows {
      let (id, queued_at) = row.map_err(|e| eyre!("Failed to read queue row: {}", e))?;
      summaries.push(PendingSurvey {
        id,
        timestamp: parse_timestamp(&queued_at)?,
      });
    }

    Ok(summaries)
  }

  fn delete(&self, id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete submission {}: {}", id, e))?;

    Ok(())
  }

  fn count(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;

    Ok(count as usize)
  }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}

#[cfg(test)]
pub mod testing {
  //! Store doubles for tests.

  use super::*;

  /// A queue store whose every operation fails, for exercising degraded
  /// paths (unreachable store, capture failure).
  pub struct FailingStore;

  impl QueueStore for FailingStore {
    fn upsert(&self, _submission: &QueuedSubmission) -> Result<()> {
      Err(eyre!("queue store unavailable"))
    }

    fn list_all(&self) -> Result<Vec<QueuedSubmission>> {
      Err(eyre!("queue store unavailable"))
    }

    fn summaries(&self) -> Result<Vec<PendingSurvey>> {
      Err(eyre!("queue store unavailable"))
    }

    fn delete(&self, _id: &str) -> Result<()> {
      Err(eyre!("queue store unavailable"))
    }

    fn count(&self) -> Result<usize> {
      Err(eyre!("queue store unavailable"))
    }
  }
}
