//! Named cache trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::CachedResponse;
use crate::http::{headers_from_pairs, headers_to_pairs, Response};

/// Request-keyed response storage partitioned into named caches.
///
/// Mirrors the browser Cache Storage API: caches are created on first open
/// or put, enumerated by name and dropped as a whole.
pub trait KeyedCache: Send + Sync + 'static {
  /// Create the named cache if it does not exist.
  fn open(&self, cache_name: &str) -> Result<()>;

  /// Look up a request key in one cache.
  fn lookup(&self, cache_name: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Look up a request key in every cache, oldest cache first.
  fn lookup_any(&self, key: &str) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any previous entry for the key.
  fn put(&self, cache_name: &str, key: &str, response: &Response) -> Result<()>;

  /// Names of all existing caches.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Drop a cache and all its entries. Returns whether it existed.
  fn delete_cache(&self, cache_name: &str) -> Result<bool>;
}

/// SQLite-based named cache storage.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Throwaway storage for tests.
  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
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

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_names (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One stored response per (cache, request key)
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(request_key);
"#;

type EntryRow = (u16, String, Vec<u8>, String);

impl KeyedCache for SqliteCacheStorage {
  fn open(&self, cache_name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", cache_name, e))?;

    Ok(())
  }

  fn lookup(&self, cache_name: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
        params![cache_name, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache {}: {}", cache_name, e))?;

    row.map(decode_entry).transpose()
  }

  fn lookup_any(&self, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT ce.status, ce.headers, ce.body, ce.cached_at FROM cache_entries ce
         INNER JOIN cache_names cn ON cn.name = ce.cache_name
         WHERE ce.request_key = ?
         ORDER BY cn.rowid
         LIMIT 1",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to search caches: {}", e))?;

    row.map(decode_entry).transpose()
  }

  fn put(&self, cache_name: &str, key: &str, response: &Response) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_string(&headers_to_pairs(&response.headers))
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", cache_name, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, request_key, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, datetime('now'))",
      params![cache_name, key, response.status.as_u16(), headers, response.body],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_names ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, cache_name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", cache_name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_names WHERE name = ?", params![cache_name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }
}

fn decode_entry((status, headers, body, cached_at): EntryRow) -> Result<CachedResponse> {
  let pairs: Vec<(String, String)> =
    serde_json::from_str(&headers).map_err(|e| eyre!("Corrupt cached headers: {}", e))?;
  let status = reqwest::StatusCode::from_u16(status)
    .map_err(|e| eyre!("Corrupt cached status {}: {}", status, e))?;

  Ok(CachedResponse {
    response: Response {
      status,
      headers: headers_from_pairs(&pairs),
      body,
    },
    cached_at: parse_datetime(&cached_at)?,
  })
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::StatusCode;

  fn ok(body: &str) -> Response {
    Response::text(StatusCode::OK, body)
  }

  #[test]
  fn test_put_then_lookup() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    storage.put("static-v1", "https://a/app.js", &ok("js")).unwrap();

    let hit = storage.lookup("static-v1", "https://a/app.js").unwrap().unwrap();
    assert_eq!(hit.response.status, StatusCode::OK);
    assert_eq!(hit.response.body_text(), "js");
    assert_eq!(
      hit.response.headers["content-type"],
      "text/plain; charset=utf-8"
    );
  }

  #[test]
  fn test_caches_are_partitioned() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    storage.put("api-v1", "https://a/api/x", &ok("api")).unwrap();

    assert!(storage.lookup("static-v1", "https://a/api/x").unwrap().is_none());
    assert!(storage.lookup_any("https://a/api/x").unwrap().is_some());
  }

  #[test]
  fn test_put_replaces_entry() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    storage.put("pages-v1", "k", &ok("old")).unwrap();
    storage.put("pages-v1", "k", &ok("new")).unwrap();

    let hit = storage.lookup("pages-v1", "k").unwrap().unwrap();
    assert_eq!(hit.response.body_text(), "new");
  }

  #[test]
  fn test_delete_cache_drops_entries() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    storage.open("empty-v1").unwrap();
    storage.put("static-v1", "k", &ok("x")).unwrap();

    assert_eq!(storage.cache_names().unwrap(), vec!["empty-v1", "static-v1"]);
    assert!(storage.delete_cache("static-v1").unwrap());
    assert!(!storage.delete_cache("static-v1").unwrap());
    assert!(storage.lookup_any("k").unwrap().is_none());
    assert_eq!(storage.cache_names().unwrap(), vec!["empty-v1"]);
  }

  #[test]
  fn test_open_is_idempotent() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    storage.open("static-v1").unwrap();
    storage.open("static-v1").unwrap();
    assert_eq!(storage.cache_names().unwrap().len(), 1);
  }
}
