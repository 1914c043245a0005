//! Cache storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::keys::RequestKey;
use super::traits::{CacheEntry, Response};

/// Trait for cache storage backends.
///
/// Reads never apply expiration; callers decide whether a stale entry is acceptable.
pub trait CacheStorage: Send + Sync {
  /// Get the entry for a request, if any.
  fn read(&self, bucket: &str, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Store an entry, evicting the oldest entries first so the bucket stays within
  /// `max_entries`. Returns the number of evicted entries.
  fn write(&self, bucket: &str, key: &RequestKey, entry: &CacheEntry, max_entries: usize)
    -> Result<usize>;

  /// All readable entries of a bucket in insertion order.
  fn entries(&self, bucket: &str) -> Result<Vec<CacheEntry>>;

  /// Remove one entry. Returns whether it existed.
  fn delete_entry(&self, bucket: &str, key: &RequestKey) -> Result<bool>;

  /// Names of all existing buckets.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Drop a bucket and everything in it. Returns whether it existed.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;
}

/// Number of oldest entries to remove before inserting into a bucket holding `count`.
pub fn eviction_count(count: usize, max_entries: usize) -> usize {
  if count >= max_entries {
    count - max_entries + 1
  } else {
    0
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when the layer failed to register - every request goes to the network.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn read(&self, _bucket: &str, _key: &RequestKey) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn write(
    &self,
    _bucket: &str,
    _key: &RequestKey,
    _entry: &CacheEntry,
    _max_entries: usize,
  ) -> Result<usize> {
    Ok(0) // Discard
  }

  fn entries(&self, _bucket: &str) -> Result<Vec<CacheEntry>> {
    Ok(Vec::new())
  }

  fn delete_entry(&self, _bucket: &str, _key: &RequestKey) -> Result<bool> {
    Ok(false)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_bucket(&self, _bucket: &str) -> Result<bool> {
    Ok(false)
  }
}

/// SQLite-based storage for cache buckets, the order outbox and lifecycle state.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Throwaway database, used by tests.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))
  }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- seq preserves insertion order and drives oldest-first eviction
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    UNIQUE (bucket, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_bucket ON cache_entries(bucket, seq);

CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, id);

CREATE TABLE IF NOT EXISTS lifecycle (
    version TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    skip_waiting INTEGER NOT NULL DEFAULT 0
);
"#;

fn row_to_entry(url: String, status: u16, headers: &str, body: Vec<u8>) -> Result<CacheEntry> {
  let headers: Vec<(String, String)> = serde_json::from_str(headers)
    .map_err(|e| eyre!("Failed to decode headers for {}: {}", url, e))?;
  let response = Response {
    status,
    headers,
    body,
  };
  CacheEntry::from_stored(url.clone(), response)
    .ok_or_else(|| eyre!("Cache entry for {} is missing its metadata headers", url))
}

impl CacheStorage for SqliteStorage {
  fn read(&self, bucket: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(String, u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT url, status, headers, body FROM cache_entries
         WHERE bucket = ? AND key_hash = ?",
        params![bucket, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((url, status, headers, body)) => row_to_entry(url, status, &headers, body).map(Some),
      None => Ok(None),
    }
  }

  fn write(
    &self,
    bucket: &str,
    key: &RequestKey,
    entry: &CacheEntry,
    max_entries: usize,
  ) -> Result<usize> {
    if max_entries == 0 {
      debug!(bucket, "Bucket holds no entries, skipping write");
      return Ok(0);
    }

    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to encode headers: {}", e))?;
    let key_hash = key.cache_hash();

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to create bucket {}: {}", bucket, e))?;

    // A rewrite replaces the old entry and becomes the newest one
    tx.execute(
      "DELETE FROM cache_entries WHERE bucket = ? AND key_hash = ?",
      params![bucket, key_hash],
    )
    .map_err(|e| eyre!("Failed to replace cache entry: {}", e))?;

    let count: i64 = tx
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE bucket = ?",
        params![bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count bucket {}: {}", bucket, e))?;

    let evicted = eviction_count(count as usize, max_entries);
    if evicted > 0 {
      tx.execute(
        "DELETE FROM cache_entries WHERE seq IN (
           SELECT seq FROM cache_entries WHERE bucket = ? ORDER BY seq LIMIT ?
         )",
        params![bucket, evicted as i64],
      )
      .map_err(|e| eyre!("Failed to evict from {}: {}", bucket, e))?;
      debug!(bucket, evicted, "Evicted oldest entries");
    }

    tx.execute(
      "INSERT INTO cache_entries (bucket, key_hash, url, status, headers, body)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        bucket,
        key_hash,
        key.url(),
        entry.response.status,
        headers,
        entry.response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(evicted)
  }

  fn entries(&self, bucket: &str) -> Result<Vec<CacheEntry>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT url, status, headers, body FROM cache_entries
         WHERE bucket = ? ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows: Vec<(String, u16, String, Vec<u8>)> = stmt
      .query_map(params![bucket], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read entries: {}", e))?;

    let mut entries = Vec::with_capacity(rows.len());
    for (url, status, headers, body) in rows {
      match row_to_entry(url, status, &headers, body) {
        Ok(entry) => entries.push(entry),
        Err(e) => warn!(bucket, "Skipping unreadable cache entry: {}", e),
      }
    }
    Ok(entries)
  }

  fn delete_entry(&self, bucket: &str, key: &RequestKey) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE bucket = ? AND key_hash = ?",
        params![bucket, key.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(removed > 0)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare bucket query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket names: {}", e))?;
    Ok(names)
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE bucket = ?",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to clear bucket {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }
}
