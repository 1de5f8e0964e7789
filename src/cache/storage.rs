//! Cache storage trait with in-memory and SQLite implementations.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::net::{Response, ResponseKind};

use super::traits::{CachedEntry, RequestKey};

/// Trait for cache storage backends.
///
/// Every method is a short critical section; none waits on the network.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if absent. Returns whether it was created.
  fn open_namespace(&self, name: &str) -> Result<bool, StoreError>;

  fn has_namespace(&self, name: &str) -> Result<bool, StoreError>;

  /// Store a response, replacing any previous entry for the key.
  ///
  /// Never creates the namespace: writing into a missing or deleted one
  /// fails with [`StoreError::MissingNamespace`].
  fn put(&self, namespace: &str, key: &RequestKey, response: &Response) -> Result<(), StoreError>;

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedEntry>, StoreError>;

  /// All namespace names in name order.
  fn namespaces(&self) -> Result<Vec<String>, StoreError>;

  /// Delete a namespace and its entries. Returns whether it existed.
  fn delete_namespace(&self, name: &str) -> Result<bool, StoreError>;

  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>, StoreError>;
}

type Entries = HashMap<String, (RequestKey, CachedEntry)>;

/// Storage held in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
  namespaces: Mutex<BTreeMap<String, Entries>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Entries>>, StoreError> {
    self.namespaces.lock().map_err(|_| StoreError::LockPoisoned)
  }
}

impl CacheStorage for MemoryStorage {
  fn open_namespace(&self, name: &str) -> Result<bool, StoreError> {
    let mut namespaces = self.lock()?;
    if namespaces.contains_key(name) {
      return Ok(false);
    }
    namespaces.insert(name.to_string(), HashMap::new());
    Ok(true)
  }

  fn has_namespace(&self, name: &str) -> Result<bool, StoreError> {
    Ok(self.lock()?.contains_key(name))
  }

  fn put(&self, namespace: &str, key: &RequestKey, response: &Response) -> Result<(), StoreError> {
    let entry = CachedEntry {
      response: response.clone(),
      cached_at: Utc::now(),
    };
    let mut namespaces = self.lock()?;
    let entries = namespaces
      .get_mut(namespace)
      .ok_or_else(|| StoreError::MissingNamespace(namespace.to_string()))?;
    entries.insert(key.cache_hash(), (key.clone(), entry));
    Ok(())
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedEntry>, StoreError> {
    Ok(
      self
        .lock()?
        .get(namespace)
        .and_then(|entries| entries.get(&key.cache_hash()))
        .map(|(_, entry)| entry.clone()),
    )
  }

  fn namespaces(&self) -> Result<Vec<String>, StoreError> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn delete_namespace(&self, name: &str) -> Result<bool, StoreError> {
    Ok(self.lock()?.remove(name).is_some())
  }

  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>, StoreError> {
    let namespaces = self.lock()?;
    let mut keys: Vec<RequestKey> = namespaces
      .get(namespace)
      .map(|entries| entries.values().map(|(k, _)| k.clone()).collect())
      .unwrap_or_default();
    keys.sort_by(|a, b| a.url.cmp(&b.url).then_with(|| a.method.cmp(&b.method)));
    Ok(keys)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<(), StoreError> {
    self.lock()?.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One response per (namespace, request key)
CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    kind TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key_hash),
    FOREIGN KEY (namespace) REFERENCES namespaces(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_namespace ON entries(namespace);
"#;

impl CacheStorage for SqliteStorage {
  fn open_namespace(&self, name: &str) -> Result<bool, StoreError> {
    let conn = self.lock()?;
    let inserted = conn.execute(
      "INSERT OR IGNORE INTO namespaces (name) VALUES (?)",
      params![name],
    )?;
    Ok(inserted > 0)
  }

  fn has_namespace(&self, name: &str) -> Result<bool, StoreError> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM namespaces WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()?;
    Ok(found.is_some())
  }

  fn put(&self, namespace: &str, key: &RequestKey, response: &Response) -> Result<(), StoreError> {
    let headers = serde_json::to_string(&response.headers)?;
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let exists = tx
      .query_row(
        "SELECT 1 FROM namespaces WHERE name = ?",
        params![namespace],
        |_| Ok(()),
      )
      .optional()?
      .is_some();
    if !exists {
      return Err(StoreError::MissingNamespace(namespace.to_string()));
    }

    tx.execute(
      "INSERT OR REPLACE INTO entries (namespace, key_hash, method, url, status, kind, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        namespace,
        key.cache_hash(),
        key.method,
        key.url,
        response.status,
        response.kind.as_str(),
        headers,
        &response.body[..],
      ],
    )?;

    tx.commit()?;
    Ok(())
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedEntry>, StoreError> {
    let conn = self.lock()?;

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, kind, headers, body, cached_at FROM entries
         WHERE namespace = ? AND key_hash = ?",
        params![namespace, key.cache_hash()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()?;

    let Some((status, kind, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let kind = ResponseKind::parse(&kind).ok_or_else(|| StoreError::Corrupt(kind.clone()))?;
    let response = Response {
      status,
      headers: serde_json::from_str(&headers)?,
      body: body.into(),
      kind,
    };

    Ok(Some(CachedEntry {
      response,
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn namespaces(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM namespaces ORDER BY name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn delete_namespace(&self, name: &str) -> Result<bool, StoreError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entries WHERE namespace = ?", params![name])?;
    let removed = tx.execute("DELETE FROM namespaces WHERE name = ?", params![name])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT method, url FROM entries WHERE namespace = ? ORDER BY url, method",
    )?;
    let keys = stmt
      .query_map(params![namespace], |row| {
        Ok(RequestKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|_| StoreError::Corrupt(s.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::Request;

  fn key(url: &str) -> RequestKey {
    RequestKey::from_request(&Request::get(url.parse().unwrap()))
  }

  fn exercise(storage: &dyn CacheStorage) {
    assert!(storage.open_namespace("v1-static").unwrap());
    assert!(!storage.open_namespace("v1-static").unwrap());
    assert!(storage.has_namespace("v1-static").unwrap());
    assert!(!storage.has_namespace("v1-dynamic").unwrap());

    let response = Response::new(200, "hello").with_header("ETag", "\"1\"");
    storage
      .put("v1-static", &key("https://example.com/a"), &response)
      .unwrap();

    let cached = storage
      .get("v1-static", &key("https://example.com/a"))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response, response);
    assert!(storage
      .get("v1-static", &key("https://example.com/b"))
      .unwrap()
      .is_none());

    // Last write wins
    let replaced = Response::new(200, "bye");
    storage
      .put("v1-static", &key("https://example.com/a"), &replaced)
      .unwrap();
    let cached = storage
      .get("v1-static", &key("https://example.com/a"))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body.as_ref(), b"bye");

    // Writes never create a namespace
    let err = storage
      .put("v1-dynamic", &key("https://example.com/c"), &replaced)
      .unwrap_err();
    assert!(matches!(err, StoreError::MissingNamespace(ref name) if name == "v1-dynamic"));
    assert!(!storage.has_namespace("v1-dynamic").unwrap());

    storage.open_namespace("v1-dynamic").unwrap();
    storage
      .put("v1-dynamic", &key("https://example.com/c"), &replaced)
      .unwrap();
    assert_eq!(storage.namespaces().unwrap(), vec!["v1-dynamic", "v1-static"]);
    assert_eq!(
      storage.keys("v1-dynamic").unwrap(),
      vec![key("https://example.com/c")]
    );

    assert!(storage.delete_namespace("v1-dynamic").unwrap());
    assert!(!storage.delete_namespace("v1-dynamic").unwrap());
    assert!(storage
      .get("v1-dynamic", &key("https://example.com/c"))
      .unwrap()
      .is_none());
    assert_eq!(storage.namespaces().unwrap(), vec!["v1-static"]);

    // A deleted namespace stays deleted
    assert!(storage
      .put("v1-dynamic", &key("https://example.com/c"), &replaced)
      .is_err());
    assert_eq!(storage.namespaces().unwrap(), vec!["v1-static"]);
  }

  #[test]
  fn test_memory_storage() {
    exercise(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_storage() {
    exercise(&SqliteStorage::open_in_memory().unwrap());
  }

  #[test]
  fn test_sqlite_storage_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.open_namespace("v1-dynamic").unwrap();
      let response = Response::new(200, vec![0u8, 1, 2, 255])
        .with_kind(ResponseKind::Cors)
        .with_header("content-type", "application/octet-stream");
      storage
        .put("v1-dynamic", &key("https://cdn.example.net/x.bin"), &response)
        .unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let cached = storage
      .get("v1-dynamic", &key("https://cdn.example.net/x.bin"))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body.as_ref(), &[0u8, 1, 2, 255]);
    assert_eq!(cached.response.kind, ResponseKind::Cors);
    assert_eq!(
      cached.response.header("content-type"),
      Some("application/octet-stream")
    );
  }
}
