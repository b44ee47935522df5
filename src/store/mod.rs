//! Persistent key-value storage.
//!
//! The store is pure storage with no policy: string keys, opaque byte values.
//! The cache and the mutation queue layer their own formats on top, each under
//! its own key prefix.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::Result;

/// Durable asynchronous key-value storage.
///
/// Implementations must give read-after-write consistency for a single key
/// from a single caller. No ordering is promised between concurrent calls on
/// different keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
  /// Get the value stored under `key`.
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Store `value` under `key`, replacing any previous value.
  ///
  /// A failed set must leave the previous value intact.
  async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

  /// Remove `key`. Removing a missing key is not an error.
  async fn remove(&self, key: &str) -> Result<()>;

  /// Remove every key in `keys`.
  async fn remove_many(&self, keys: &[String]) -> Result<()>;

  /// List keys starting with `prefix`, in ascending order.
  async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}
