//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CachedEntry, Namespace, RequestIdentity, ResponseSnapshot};

/// Trait for cache storage backends.
///
/// Writes to the same identity are last-write-wins. Implementations must
/// tolerate concurrent use from several tasks.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if missing and return a handle to it.
  fn open(&self, name: &str) -> Result<Namespace>;

  /// Upsert a single entry.
  fn put(
    &self,
    namespace: &Namespace,
    identity: &RequestIdentity,
    response: &ResponseSnapshot,
  ) -> Result<()>;

  /// Upsert several entries atomically: all of them land or none do.
  fn put_all(
    &self,
    namespace: &Namespace,
    entries: &[(RequestIdentity, ResponseSnapshot)],
  ) -> Result<()>;

  /// Look up an identity in one namespace, or across all of them when
  /// `namespace` is `None`. Returns the most recently written match.
  fn match_request(
    &self,
    identity: &RequestIdentity,
    namespace: Option<&Namespace>,
  ) -> Result<Option<CachedEntry>>;

  /// All namespaces currently persisted.
  fn namespace_names(&self) -> Result<Vec<String>>;

  /// Remove a namespace and its entries. Returns whether it existed.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Number of entries stored in a namespace.
  fn entry_count(&self, name: &str) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when the real store cannot be opened - the policy then behaves
/// as network-only.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn open(&self, name: &str) -> Result<Namespace> {
    Ok(Namespace::new(name))
  }

  fn put(&self, _: &Namespace, _: &RequestIdentity, _: &ResponseSnapshot) -> Result<()> {
    Ok(()) // Discard
  }

  fn put_all(&self, _: &Namespace, _: &[(RequestIdentity, ResponseSnapshot)]) -> Result<()> {
    Ok(()) // Discard
  }

  fn match_request(
    &self,
    _identity: &RequestIdentity,
    _namespace: Option<&Namespace>,
  ) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn namespace_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete(&self, _name: &str) -> Result<bool> {
    Ok(false)
  }

  fn entry_count(&self, _name: &str) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the store at `path`.
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

  /// Open a throwaway store that lives only as long as this value.
  #[cfg_attr(not(test), allow(dead_code))]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
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

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per (namespace, request identity). Replacing a row assigns a
-- fresh rowid, so the highest rowid is always the latest write.
CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    identity_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, identity_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_identity ON entries(identity_hash);
"#;

fn ensure_namespace(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO namespaces (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create namespace {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  namespace: &Namespace,
  identity: &RequestIdentity,
  response: &ResponseSnapshot,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (namespace, identity_hash, method, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        namespace.name(),
        identity.cache_hash(),
        identity.method,
        identity.url,
        response.status,
        headers,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store entry for {}: {}", identity.url, e))?;

  Ok(())
}

type EntryRow = (String, String, u16, String, Vec<u8>, String);

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<Namespace> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    ensure_namespace(&conn, name)?;
    Ok(Namespace::new(name))
  }

  fn put(
    &self,
    namespace: &Namespace,
    identity: &RequestIdentity,
    response: &ResponseSnapshot,
  ) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    ensure_namespace(&conn, namespace.name())?;
    insert_entry(&conn, namespace, identity, response)
  }

  fn put_all(
    &self,
    namespace: &Namespace,
    entries: &[(RequestIdentity, ResponseSnapshot)],
  ) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Rolled back on drop unless committed
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_namespace(&tx, namespace.name())?;
    for (identity, response) in entries {
      insert_entry(&tx, namespace, identity, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_request(
    &self,
    identity: &RequestIdentity,
    namespace: Option<&Namespace>,
  ) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT method, url, status, headers, body, stored_at FROM entries
         WHERE identity_hash = ?1 AND (?2 IS NULL OR namespace = ?2)
         ORDER BY rowid DESC
         LIMIT 1",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<EntryRow> = stmt
      .query_row(
        params![identity.cache_hash(), namespace.map(Namespace::name)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", identity.url, e))?;

    let Some((method, url, status, headers, body, stored_at)) = row else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;

    Ok(Some(CachedEntry {
      identity: RequestIdentity { method, url },
      response: ResponseSnapshot::new(status, headers, body),
      stored_at: parse_datetime(&stored_at)?,
    }))
  }

  fn namespace_names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM namespaces ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE namespace = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM namespaces WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE namespace = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", name, e))?;

    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
