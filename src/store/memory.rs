//! In-process key-value store.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::KeyValueStore;
use crate::error::{Result, SyncError};

/// Key-value store held in memory.
///
/// Useful for tests and for running without a data directory. The medium can
/// be switched off with [`MemoryStore::set_available`] to exercise storage
/// failure paths. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
  data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
  unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent call fail with `StorageIo` (or succeed again).
  pub fn set_available(&self, available: bool) {
    self.unavailable.store(!available, Ordering::SeqCst);
  }

  /// Number of stored keys, across all prefixes.
  pub fn len(&self) -> usize {
    self.data.lock().map(|d| d.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn check(&self) -> Result<()> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(SyncError::StorageIo("memory store switched off".into()));
    }
    Ok(())
  }

  fn data(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
    self.check()?;
    self
      .data
      .lock()
      .map_err(|e| SyncError::StorageIo(format!("lock poisoned: {}", e)))
  }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.data()?.get(key).cloned())
  }

  async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
    self.data()?.insert(key.to_string(), value);
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<()> {
    self.data()?.remove(key);
    Ok(())
  }

  async fn remove_many(&self, keys: &[String]) -> Result<()> {
    let mut data = self.data()?;
    for key in keys {
      data.remove(key);
    }
    Ok(())
  }

  async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
    Ok(
      self
        .data()?
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }
}
