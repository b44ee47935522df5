//! TTL cache over the key-value store.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, de::IgnoredAny, Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::store::KeyValueStore;

/// Key prefix for cache entries inside the shared store.
pub const CACHE_PREFIX: &str = "cache:";

/// A single cached value.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub key: String,
  pub payload: T,
  /// When the entry was last refreshed
  pub written_at: DateTime<Utc>,
}

/// On-disk shape of an entry.
#[derive(Deserialize)]
struct StoredEntry<T> {
  written_at: DateTime<Utc>,
  payload: T,
}

#[derive(Serialize)]
struct StoredEntryRef<'a, T> {
  written_at: DateTime<Utc>,
  payload: &'a T,
}

/// Cache of serialized values with write timestamps.
///
/// Each entry lives under its own key so one corrupt entry never takes the
/// rest of the cache down with it. Staleness is decided per read by the
/// caller's max age.
#[derive(Clone)]
pub struct CacheStore {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
}

impl CacheStore {
  pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
    Self { store, clock }
  }

  fn storage_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
  }

  /// Whether an entry written at `written_at` is within `max_age`.
  ///
  /// A negative max age matches nothing.
  pub fn is_fresh(&self, written_at: DateTime<Utc>, max_age: Duration) -> bool {
    max_age >= Duration::zero() && self.clock.now() - written_at <= max_age
  }

  /// Read a value if it exists and is no older than `max_age`.
  pub async fn read<T: DeserializeOwned>(&self, key: &str, max_age: Duration) -> Result<Option<T>> {
    match self.read_entry::<T>(key).await? {
      Some(entry) if self.is_fresh(entry.written_at, max_age) => {
        debug!(key, "cache hit");
        Ok(Some(entry.payload))
      }
      Some(entry) => {
        debug!(key, written_at = %entry.written_at, "cache entry stale");
        Ok(None)
      }
      None => {
        debug!(key, "cache miss");
        Ok(None)
      }
    }
  }

  /// Read an entry regardless of age.
  ///
  /// An entry that fails to decode is evicted and reported as missing.
  pub async fn read_entry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
    let storage_key = Self::storage_key(key);
    let Some(bytes) = self.store.get(&storage_key).await? else {
      return Ok(None);
    };

    match serde_json::from_slice::<StoredEntry<T>>(&bytes) {
      Ok(stored) => Ok(Some(CacheEntry {
        key: key.to_string(),
        payload: stored.payload,
        written_at: stored.written_at,
      })),
      Err(e) => {
        let err = SyncError::CacheCorruptEntry {
          key: key.to_string(),
          reason: e.to_string(),
        };
        warn!(error = %err, "evicting corrupt cache entry");
        if let Err(e) = self.store.remove(&storage_key).await {
          warn!(key, error = %e, "failed to evict corrupt cache entry");
        }
        Ok(None)
      }
    }
  }

  /// Store `value` under `key`, stamped with the current time.
  pub async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let storage_key = Self::storage_key(key);
    let now = self.clock.now();

    // Never move an entry's timestamp backwards, even if the wall clock does
    let written_at = match self.previous_written_at(&storage_key).await? {
      Some(previous) if previous > now => previous,
      _ => now,
    };

    let bytes = serde_json::to_vec(&StoredEntryRef {
      written_at,
      payload: value,
    })?;
    self.store.set(&storage_key, bytes).await
  }

  async fn previous_written_at(&self, storage_key: &str) -> Result<Option<DateTime<Utc>>> {
    let Some(bytes) = self.store.get(storage_key).await? else {
      return Ok(None);
    };
    Ok(
      serde_json::from_slice::<StoredEntry<IgnoredAny>>(&bytes)
        .ok()
        .map(|e| e.written_at),
    )
  }

  pub async fn invalidate(&self, key: &str) -> Result<()> {
    self.store.remove(&Self::storage_key(key)).await
  }

  /// Remove every entry whose key starts with `prefix`. Returns how many.
  pub async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
    let keys = self.store.list_keys(&Self::storage_key(prefix)).await?;
    self.store.remove_many(&keys).await?;
    Ok(keys.len())
  }

  /// Remove every cache entry. Returns how many.
  pub async fn invalidate_all(&self) -> Result<usize> {
    self.invalidate_prefix("").await
  }

  /// Number of cached entries.
  pub async fn count(&self) -> Result<usize> {
    Ok(self.store.list_keys(CACHE_PREFIX).await?.len())
  }
}
