//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::fetch::Response;

/// A cached response: the most recent body and headers stored for a URL.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: HashMap<String, String>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl CachedResponse {
  pub fn into_response(self) -> Response {
    Response {
      status: self.status,
      headers: self.headers,
      body: self.body,
    }
  }
}

/// Trait for named-cache storage backends.
///
/// Entries are keyed `(cache_name, url)`; storing overwrites the prior
/// entry for that key.
pub trait CacheStore: Send + Sync {
  /// Store a response under a cache name, replacing any prior entry.
  fn store(&self, cache_name: &str, url: &str, response: &Response) -> Result<()>;

  /// Look up the cached response for a URL, or miss.
  fn lookup(&self, cache_name: &str, url: &str) -> Result<Option<CachedResponse>>;

  /// Names of every cache that currently holds at least one entry.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a whole named cache.
  fn delete_cache(&self, cache_name: &str) -> Result<()>;
}

/// SQLite-backed cache store.
pub struct SqliteCacheStore {
  conn: Mutex<Connection>,
}

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entry (
    cache_name TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (cache_name, url)
);

CREATE INDEX IF NOT EXISTS idx_cache_entry_name ON cache_entry(cache_name);
"#;

impl SqliteCacheStore {
  /// Open or create the cache database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// In-memory store, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;

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
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

impl CacheStore for SqliteCacheStore {
  fn store(&self, cache_name: &str, url: &str, response: &Response) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entry (cache_name, url, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          cache_name,
          url,
          response.status,
          headers,
          response.body,
          Utc::now().to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to cache {} in {}: {}", url, cache_name, e))?;

    Ok(())
  }

  fn lookup(&self, cache_name: &str, url: &str) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, stored_at FROM cache_entry
         WHERE cache_name = ? AND url = ?",
      )
      .map_err(|e| eyre!("Failed to prepare cache lookup: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![cache_name, url], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: HashMap<String, String> = serde_json::from_str(&headers).unwrap_or_default();
        let stored_at = DateTime::parse_from_rfc3339(&stored_at)
          .map(|dt| dt.with_timezone(&Utc))
          .map_err(|e| eyre!("Failed to parse cache timestamp '{}': {}", stored_at, e))?;

        Ok(Some(CachedResponse {
          status,
          headers,
          body,
          stored_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM cache_entry ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare cache names query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list cache names: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_cache(&self, cache_name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM cache_entry WHERE cache_name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))?;

    Ok(())
  }
}
