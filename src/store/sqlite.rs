//! SQLite key-value store.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::KeyValueStore;
use crate::error::{Result, SyncError};

/// Schema for the key-value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// SQLite-backed key-value store.
///
/// rusqlite is blocking, so every call runs on tokio's blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
  /// Open or create the store at the default location.
  pub fn open_default() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open(&path)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::StorageUnavailable(format!(
          "failed to create storage directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::StorageUnavailable(format!(
        "failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    debug!(path = %path.display(), "opened offline store");
    Self::with_connection(conn)
  }

  /// Open a private in-memory database. Nothing survives the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to open in-memory db: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::StorageUnavailable("could not determine data directory".into()))?;

    Ok(data_dir.join("catalog-sync").join("offline.db"))
  }

  /// Run database migrations for the kv table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("lock poisoned: {}", e)))?;

    conn.execute_batch(KV_SCHEMA).map_err(|e| {
      SyncError::StorageUnavailable(format!("failed to run store migrations: {}", e))
    })?;

    Ok(())
  }

  /// Run `f` against the connection on the blocking pool.
  async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let mut conn = conn
        .lock()
        .map_err(|e| SyncError::StorageIo(format!("lock poisoned: {}", e)))?;
      f(&mut conn)
    })
    .await?
  }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        let value = conn
          .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
            row.get::<_, Vec<u8>>(0)
          })
          .optional()?;
        Ok(value)
      })
      .await
  }

  async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, ?)",
          params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
      })
      .await
  }

  async fn remove(&self, key: &str) -> Result<()> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        conn.execute("DELETE FROM kv WHERE key = ?", params![key])?;
        Ok(())
      })
      .await
  }

  async fn remove_many(&self, keys: &[String]) -> Result<()> {
    if keys.is_empty() {
      return Ok(());
    }
    let keys = keys.to_vec();
    self
      .with_conn(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut stmt = tx.prepare("DELETE FROM kv WHERE key = ?")?;
          for key in &keys {
            stmt.execute(params![key])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await
  }

  async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
    let prefix = prefix.to_string();
    self
      .with_conn(move |conn| {
        // substr comparison avoids LIKE wildcard escaping on arbitrary prefixes
        let mut stmt = conn.prepare(
          "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let keys = stmt
          .query_map(params![prefix], |row| row.get::<_, String>(0))?
          .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
      })
      .await
  }
}
