//! Offline entity store for businesses, documents, permits and settings.
//!
//! Everything the portal needs while disconnected lives in one SQLite
//! database. Ids and timestamps are assigned here; lists come back newest
//! first.

mod records;
mod sync;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::config::Config;

pub use records::{
  Address, AppSettings, Business, Document, Language, NotificationSettings, Permit, Stored, Theme,
};
pub use sync::{ConnectivityMonitor, NoopRemote, RemoteSync, SyncController};

const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS businesses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    street TEXT NOT NULL,
    city TEXT NOT NULL,
    state TEXT NOT NULL,
    zip TEXT NOT NULL,
    municipality TEXT NOT NULL,
    business_type TEXT NOT NULL,
    permit_status TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_businesses_created ON businesses(created_at);

CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    business_id INTEGER NOT NULL,
    filename TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size INTEGER NOT NULL,
    data BLOB NOT NULL,
    quality_score REAL,
    issues TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_documents_business ON documents(business_id);
CREATE INDEX IF NOT EXISTS idx_documents_created ON documents(created_at);

CREATE TABLE IF NOT EXISTS permits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    business_id INTEGER NOT NULL,
    category TEXT NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    description TEXT NOT NULL,
    estimated_cost REAL,
    estimated_days INTEGER,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_permits_business ON permits(business_id);
CREATE INDEX IF NOT EXISTS idx_permits_created ON permits(created_at);

-- Single row, seeded on open
CREATE TABLE IF NOT EXISTS settings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    language TEXT NOT NULL,
    theme TEXT NOT NULL,
    notify_email INTEGER NOT NULL,
    notify_sms INTEGER NOT NULL,
    notify_push INTEGER NOT NULL,
    last_sync TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
);
"#;

const BUSINESS_COLUMNS: &str = "id, created_at, updated_at, name, street, city, state, zip, \
  municipality, business_type, permit_status";

const DOCUMENT_COLUMNS: &str = "id, created_at, updated_at, business_id, filename, mime_type, \
  size, data, quality_score, issues, status";

const PERMIT_COLUMNS: &str = "id, created_at, updated_at, business_id, category, name, status, \
  description, estimated_cost, estimated_days";

pub struct LocalStore {
  conn: Mutex<Connection>,
}

impl LocalStore {
  /// Open the store configured for this installation.
  pub fn open(config: &Config) -> Result<Self> {
    Self::open_at(&config.store_database()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    store.seed_default_settings()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Insert the default settings row unless one exists. Returns whether a
  /// row was written.
  pub fn seed_default_settings(&self) -> Result<bool> {
    let defaults = AppSettings::default();
    let conn = self.lock()?;

    let inserted = conn
      .execute(
        "INSERT INTO settings (language, theme, notify_email, notify_sms, notify_push)
         SELECT ?, ?, ?, ?, ?
         WHERE NOT EXISTS (SELECT 1 FROM settings)",
        params![
          defaults.language,
          defaults.theme,
          defaults.notifications.email,
          defaults.notifications.sms,
          defaults.notifications.push,
        ],
      )
      .map_err(|e| eyre!("Failed to seed settings: {}", e))?;

    if inserted > 0 {
      tracing::debug!("seeded default settings");
    }
    Ok(inserted > 0)
  }

  pub fn add_business(&self, business: &Business) -> Result<i64> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO businesses (name, street, city, state, zip, municipality, business_type, permit_status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          business.name,
          business.address.street,
          business.address.city,
          business.address.state,
          business.address.zip,
          business.address.municipality,
          business.business_type,
          business.permit_status,
        ],
      )
      .map_err(|e| eyre!("Failed to add business: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  pub fn businesses(&self) -> Result<Vec<Stored<Business>>> {
    let sql = format!(
      "SELECT {} FROM businesses ORDER BY created_at DESC, id DESC",
      BUSINESS_COLUMNS
    );
    self.query_all(&sql, [], business_from_row, "businesses")
  }

  pub fn add_document(&self, document: &Document) -> Result<i64> {
    let issues = serde_json::to_string(&document.issues)
      .map_err(|e| eyre!("Failed to serialize document issues: {}", e))?;

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO documents (business_id, filename, mime_type, size, data, quality_score, issues, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          document.business_id,
          document.filename,
          document.mime_type,
          document.size,
          document.data,
          document.quality_score,
          issues,
          document.status,
        ],
      )
      .map_err(|e| eyre!("Failed to add document {}: {}", document.filename, e))?;

    Ok(conn.last_insert_rowid())
  }

  pub fn documents(&self) -> Result<Vec<Stored<Document>>> {
    let sql = format!(
      "SELECT {} FROM documents ORDER BY created_at DESC, id DESC",
      DOCUMENT_COLUMNS
    );
    self.query_all(&sql, [], document_from_row, "documents")
  }

  pub fn documents_for_business(&self, business_id: i64) -> Result<Vec<Stored<Document>>> {
    let sql = format!(
      "SELECT {} FROM documents WHERE business_id = ? ORDER BY created_at DESC, id DESC",
      DOCUMENT_COLUMNS
    );
    self.query_all(&sql, params![business_id], document_from_row, "documents")
  }

  pub fn add_permit(&self, permit: &Permit) -> Result<i64> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO permits (business_id, category, name, status, description, estimated_cost, estimated_days)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          permit.business_id,
          permit.category,
          permit.name,
          permit.status,
          permit.description,
          permit.estimated_cost,
          permit.estimated_days,
        ],
      )
      .map_err(|e| eyre!("Failed to add permit {}: {}", permit.name, e))?;

    Ok(conn.last_insert_rowid())
  }

  pub fn permits(&self) -> Result<Vec<Stored<Permit>>> {
    let sql = format!(
      "SELECT {} FROM permits ORDER BY created_at DESC, id DESC",
      PERMIT_COLUMNS
    );
    self.query_all(&sql, [], permit_from_row, "permits")
  }

  pub fn permits_for_business(&self, business_id: i64) -> Result<Vec<Stored<Permit>>> {
    let sql = format!(
      "SELECT {} FROM permits WHERE business_id = ? ORDER BY created_at DESC, id DESC",
      PERMIT_COLUMNS
    );
    self.query_all(&sql, params![business_id], permit_from_row, "permits")
  }

  pub fn settings(&self) -> Result<AppSettings> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT language, theme, notify_email, notify_sms, notify_push, last_sync
         FROM settings ORDER BY id LIMIT 1",
        [],
        |row| {
          Ok((
            AppSettings {
              language: row.get(0)?,
              theme: row.get(1)?,
              notifications: NotificationSettings {
                email: row.get(2)?,
                sms: row.get(3)?,
                push: row.get(4)?,
              },
              last_sync: None,
            },
            row.get::<_, Option<String>>(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read settings: {}", e))?;

    let (mut settings, last_sync) = row.ok_or_else(|| eyre!("Settings row missing"))?;
    settings.last_sync = last_sync.as_deref().map(parse_rfc3339).transpose()?;
    Ok(settings)
  }

  pub fn update_settings(&self, settings: &AppSettings) -> Result<()> {
    let conn = self.lock()?;
    let updated = conn
      .execute(
        "UPDATE settings SET language = ?, theme = ?, notify_email = ?, notify_sms = ?,
           notify_push = ?, last_sync = ?,
           updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
         WHERE id = (SELECT MIN(id) FROM settings)",
        params![
          settings.language,
          settings.theme,
          settings.notifications.email,
          settings.notifications.sms,
          settings.notifications.push,
          settings.last_sync.map(|t| t.to_rfc3339()),
        ],
      )
      .map_err(|e| eyre!("Failed to update settings: {}", e))?;

    if updated == 0 {
      return Err(eyre!("Settings row missing"));
    }
    Ok(())
  }

  /// Stamp the settings with the time of the last successful sync.
  pub fn record_sync(&self, at: DateTime<Utc>) -> Result<()> {
    let mut settings = self.settings()?;
    settings.last_sync = Some(at);
    self.update_settings(&settings)
  }

  fn query_all<T, P>(
    &self,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> rusqlite::Result<Stored<T>>,
    what: &str,
  ) -> Result<Vec<Stored<T>>>
  where
    P: rusqlite::Params,
  {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params, map)
      .map_err(|e| eyre!("Failed to list {}: {}", what, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read {}: {}", what, e))?;

    Ok(rows)
  }

  #[cfg(test)]
  fn execute_raw(&self, sql: &str) -> Result<()> {
    self
      .lock()?
      .execute_batch(sql)
      .map_err(|e| eyre!("Failed to execute: {}", e))
  }
}

fn stored<T>(row: &Row<'_>, record: T) -> rusqlite::Result<Stored<T>> {
  Ok(Stored {
    id: row.get(0)?,
    created_at: timestamp_column(row, 1)?,
    updated_at: timestamp_column(row, 2)?,
    record,
  })
}

fn business_from_row(row: &Row<'_>) -> rusqlite::Result<Stored<Business>> {
  let business = Business {
    name: row.get(3)?,
    address: Address {
      street: row.get(4)?,
      city: row.get(5)?,
      state: row.get(6)?,
      zip: row.get(7)?,
      municipality: row.get(8)?,
    },
    business_type: row.get(9)?,
    permit_status: row.get(10)?,
  };
  stored(row, business)
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Stored<Document>> {
  let issues: String = row.get(9)?;
  let issues = serde_json::from_str(&issues)
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

  let document = Document {
    business_id: row.get(3)?,
    filename: row.get(4)?,
    mime_type: row.get(5)?,
    size: row.get(6)?,
    data: row.get(7)?,
    quality_score: row.get(8)?,
    issues,
    status: row.get(10)?,
  };
  stored(row, document)
}

fn permit_from_row(row: &Row<'_>) -> rusqlite::Result<Stored<Permit>> {
  let permit = Permit {
    business_id: row.get(3)?,
    category: row.get(4)?,
    name: row.get(5)?,
    status: row.get(6)?,
    description: row.get(7)?,
    estimated_cost: row.get(8)?,
    estimated_days: row.get(9)?,
  };
  stored(row, permit)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
  let raw: String = row.get(idx)?;
  chrono::NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f")
    .map(|dt| dt.and_utc())
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
