//! Durable FIFO queue of pending mutations.
//!
//! The pending and parked lists are serialized together under one store key,
//! so every mutating call is a single read-modify-write of that blob and a
//! failed write leaves both lists as they were. Each call holds the queue's
//! async mutex from load to save.

mod record;

pub use record::{MutationKind, MutationRecord};
pub(crate) use record::resource_id_of;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::store::KeyValueStore;

/// Store key holding both the pending and the parked list.
pub const QUEUE_KEY: &str = "queue:state";

/// Persisted shape of the queue.
#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueState {
  /// Records awaiting replay, in enqueue order
  pending: Vec<MutationRecord>,
  /// Records that exhausted their attempts
  #[serde(default)]
  parked: Vec<MutationRecord>,
}

impl QueueState {
  fn is_empty(&self) -> bool {
    self.pending.is_empty() && self.parked.is_empty()
  }
}

/// Ordered, persisted list of mutations waiting for the remote side.
#[derive(Clone)]
pub struct MutationQueue {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  lock: Arc<Mutex<()>>,
}

impl MutationQueue {
  pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      clock,
      lock: Arc::new(Mutex::new(())),
    }
  }

  /// Append a mutation and persist the queue.
  pub async fn enqueue(
    &self,
    kind: MutationKind,
    target: impl Into<String>,
    payload: Value,
  ) -> Result<MutationRecord> {
    let _guard = self.lock.lock().await;
    let mut state = self.load().await?;

    let record = MutationRecord::new(kind, target.into(), payload, self.clock.now());
    state.pending.push(record.clone());
    self.save(&state).await?;

    debug!(id = %record.id, kind = %record.kind, collection = %record.target, queued = state.pending.len(), "mutation queued");
    Ok(record)
  }

  /// Snapshot of pending records in enqueue order.
  pub async fn peek_all(&self) -> Result<Vec<MutationRecord>> {
    Ok(self.load().await?.pending)
  }

  pub async fn len(&self) -> Result<usize> {
    Ok(self.peek_all().await?.len())
  }

  pub async fn is_empty(&self) -> Result<bool> {
    Ok(self.len().await? == 0)
  }

  /// Remove a record by id. Missing ids are ignored.
  pub async fn remove(&self, id: &str) -> Result<()> {
    let _guard = self.lock.lock().await;
    let mut state = self.load().await?;
    let before = state.pending.len();
    state.pending.retain(|r| r.id != id);
    if state.pending.len() != before {
      self.save(&state).await?;
    }
    Ok(())
  }

  /// Drop every pending record. Parked records stay.
  pub async fn clear(&self) -> Result<()> {
    let _guard = self.lock.lock().await;
    let mut state = self.load().await?;
    if state.pending.is_empty() {
      return Ok(());
    }
    state.pending.clear();
    self.save(&state).await
  }

  /// Count a failed replay attempt against a record.
  ///
  /// Returns the updated record, or `None` if it is no longer queued.
  pub async fn record_failure(&self, id: &str, error: &str) -> Result<Option<MutationRecord>> {
    let _guard = self.lock.lock().await;
    let mut state = self.load().await?;
    let Some(record) = state.pending.iter_mut().find(|r| r.id == id) else {
      return Ok(None);
    };
    record.attempts += 1;
    record.last_error = Some(error.to_string());
    let updated = record.clone();
    self.save(&state).await?;
    Ok(Some(updated))
  }

  /// Move a pending record to the parked list.
  pub async fn park(&self, id: &str) -> Result<bool> {
    let _guard = self.lock.lock().await;
    let mut state = self.load().await?;
    let Some(pos) = state.pending.iter().position(|r| r.id == id) else {
      return Ok(false);
    };
    let record = state.pending.remove(pos);
    state.parked.push(record);
    self.save(&state).await?;

    info!(id, "mutation parked after exhausting attempts");
    Ok(true)
  }

  /// Records that exhausted their attempts.
  pub async fn parked(&self) -> Result<Vec<MutationRecord>> {
    Ok(self.load().await?.parked)
  }

  /// Remove a record from the pending or parked list.
  ///
  /// Returns whether anything was removed.
  pub async fn purge(&self, id: &str) -> Result<bool> {
    let _guard = self.lock.lock().await;
    let mut state = self.load().await?;
    let before = state.pending.len() + state.parked.len();
    state.pending.retain(|r| r.id != id);
    state.parked.retain(|r| r.id != id);
    if state.pending.len() + state.parked.len() == before {
      return Ok(false);
    }
    self.save(&state).await?;
    info!(id, "mutation purged");
    Ok(true)
  }

  /// Put every parked record back at the end of the pending list with its
  /// attempt counter reset. Returns how many were requeued.
  pub async fn requeue_parked(&self) -> Result<usize> {
    let _guard = self.lock.lock().await;
    let mut state = self.load().await?;
    if state.parked.is_empty() {
      return Ok(0);
    }

    let parked = std::mem::take(&mut state.parked);
    let count = parked.len();
    state.pending.extend(parked.into_iter().map(|mut r| {
      r.attempts = 0;
      r.last_error = None;
      r
    }));
    self.save(&state).await?;

    info!(count, "parked mutations requeued");
    Ok(count)
  }

  async fn load(&self) -> Result<QueueState> {
    match self.store.get(QUEUE_KEY).await? {
      // A blob that fails to decode is an error, never an empty queue
      Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
      None => Ok(QueueState::default()),
    }
  }

  async fn save(&self, state: &QueueState) -> Result<()> {
    if state.is_empty() {
      return self.store.remove(QUEUE_KEY).await;
    }
    let bytes = serde_json::to_vec(state)?;
    self.store.set(QUEUE_KEY, bytes).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::SystemClock;
  use crate::error::SyncError;
  use crate::store::MemoryStore;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn queue() -> (MutationQueue, MemoryStore) {
    let store = MemoryStore::new();
    (
      MutationQueue::new(Arc::new(store.clone()), Arc::new(SystemClock)),
      store,
    )
  }

  #[tokio::test]
  async fn enqueue_preserves_order() {
    let (queue, _) = queue();
    let a = queue.enqueue(MutationKind::Create, "listings", json!({"title": "a"})).await.unwrap();
    let b = queue.enqueue(MutationKind::Update, "listings", json!({"id": "p1"})).await.unwrap();
    let c = queue.enqueue(MutationKind::Delete, "listings", json!({"id": "p2"})).await.unwrap();

    let ids: Vec<String> = queue.peek_all().await.unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![a.id, b.id, c.id]);
  }

  #[tokio::test]
  async fn peek_does_not_consume() {
    let (queue, _) = queue();
    queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();
    assert_eq!(queue.peek_all().await.unwrap().len(), 1);
    assert_eq!(queue.peek_all().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn remove_is_idempotent() {
    let (queue, store) = queue();
    let a = queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();
    let b = queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();

    queue.remove(&a.id).await.unwrap();
    queue.remove(&a.id).await.unwrap();
    queue.remove("never-existed").await.unwrap();
    assert_eq!(queue.peek_all().await.unwrap(), vec![b.clone()]);

    queue.remove(&b.id).await.unwrap();
    assert!(queue.is_empty().await.unwrap());
    assert_eq!(store.get(QUEUE_KEY).await.unwrap(), None);
  }

  #[tokio::test]
  async fn clear_empties_queue() {
    let (queue, _) = queue();
    for _ in 0..3 {
      queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();
    }
    queue.clear().await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn duplicate_edits_are_kept() {
    let (queue, _) = queue();
    queue.enqueue(MutationKind::Update, "listings", json!({"id": "p1", "price": 400})).await.unwrap();
    queue.enqueue(MutationKind::Update, "listings", json!({"id": "p1", "price": 500})).await.unwrap();
    let records = queue.peek_all().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].payload["price"], 500);
  }

  #[tokio::test]
  async fn failures_park_and_requeue() {
    let (queue, _) = queue();
    let a = queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();
    let b = queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();

    let updated = queue.record_failure(&a.id, "422 invalid").await.unwrap().unwrap();
    assert_eq!(updated.attempts, 1);
    assert_eq!(updated.last_error.as_deref(), Some("422 invalid"));
    assert_eq!(updated.id, a.id);
    assert_eq!(updated.enqueued_at, a.enqueued_at);
    assert!(queue.record_failure("missing", "x").await.unwrap().is_none());

    assert!(queue.park(&a.id).await.unwrap());
    assert!(!queue.park(&a.id).await.unwrap());
    assert_eq!(queue.peek_all().await.unwrap(), vec![b.clone()]);
    assert_eq!(queue.parked().await.unwrap().len(), 1);

    assert_eq!(queue.requeue_parked().await.unwrap(), 1);
    let pending = queue.peek_all().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[1].id, a.id);
    assert_eq!(pending[1].attempts, 0);
    assert!(queue.parked().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn purge_searches_both_lists() {
    let (queue, _) = queue();
    let a = queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();
    let b = queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();
    queue.park(&b.id).await.unwrap();

    assert!(queue.purge(&b.id).await.unwrap());
    assert!(queue.purge(&a.id).await.unwrap());
    assert!(!queue.purge(&a.id).await.unwrap());
    assert!(queue.is_empty().await.unwrap());
    assert!(queue.parked().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn corrupt_blob_is_an_error_not_an_empty_queue() {
    let (queue, store) = queue();
    store.set(QUEUE_KEY, b"garbage".to_vec()).await.unwrap();
    assert!(matches!(
      queue.peek_all().await,
      Err(SyncError::Serialization(_))
    ));
    assert!(queue
      .enqueue(MutationKind::Create, "listings", json!({}))
      .await
      .is_err());
    // untouched, so the data can still be recovered by hand
    assert_eq!(store.get(QUEUE_KEY).await.unwrap(), Some(b"garbage".to_vec()));
  }

  #[tokio::test]
  async fn failed_write_leaves_queue_intact() {
    let (queue, store) = queue();
    let a = queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();

    store.set_available(false);
    assert!(queue.enqueue(MutationKind::Create, "listings", json!({})).await.is_err());
    assert!(queue.remove(&a.id).await.is_err());
    store.set_available(true);

    assert_eq!(queue.peek_all().await.unwrap(), vec![a]);
  }

  /// Store that accepts a fixed number of further writes, then fails.
  #[derive(Clone)]
  struct WriteBudget {
    inner: MemoryStore,
    left: Arc<AtomicUsize>,
  }

  impl WriteBudget {
    fn new(inner: MemoryStore) -> Self {
      Self {
        inner,
        left: Arc::new(AtomicUsize::new(usize::MAX)),
      }
    }

    fn allow(&self, writes: usize) {
      self.left.store(writes, Ordering::SeqCst);
    }

    fn spend(&self) -> Result<()> {
      self
        .left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .map(|_| ())
        .map_err(|_| SyncError::StorageIo("disk full".into()))
    }
  }

  #[async_trait::async_trait]
  impl KeyValueStore for WriteBudget {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
      self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
      self.spend()?;
      self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
      self.spend()?;
      self.inner.remove(key).await
    }

    async fn remove_many(&self, keys: &[String]) -> Result<()> {
      self.spend()?;
      self.inner.remove_many(keys).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
      self.inner.list_keys(prefix).await
    }
  }

  fn ids(records: &[MutationRecord]) -> Vec<&str> {
    records.iter().map(|r| r.id.as_str()).collect()
  }

  #[tokio::test]
  async fn failed_park_or_requeue_never_duplicates() {
    let store = WriteBudget::new(MemoryStore::new());
    let queue = MutationQueue::new(Arc::new(store.clone()), Arc::new(SystemClock));
    let a = queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();
    let b = queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();

    store.allow(0);
    assert!(queue.park(&a.id).await.is_err());
    assert_eq!(ids(&queue.peek_all().await.unwrap()), vec![a.id.as_str(), b.id.as_str()]);
    assert!(queue.parked().await.unwrap().is_empty());

    // Exactly one write is all a park needs
    store.allow(1);
    assert!(queue.park(&a.id).await.unwrap());

    assert!(queue.requeue_parked().await.is_err());
    assert_eq!(ids(&queue.peek_all().await.unwrap()), vec![b.id.as_str()]);
    assert_eq!(ids(&queue.parked().await.unwrap()), vec![a.id.as_str()]);

    store.allow(usize::MAX);
    assert_eq!(queue.requeue_parked().await.unwrap(), 1);
    assert_eq!(ids(&queue.peek_all().await.unwrap()), vec![b.id.as_str(), a.id.as_str()]);
    assert!(queue.parked().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn clear_keeps_parked_records() {
    let (queue, _) = queue();
    let a = queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();
    queue.enqueue(MutationKind::Create, "listings", json!({})).await.unwrap();
    queue.park(&a.id).await.unwrap();

    queue.clear().await.unwrap();
    assert!(queue.is_empty().await.unwrap());
    assert_eq!(ids(&queue.parked().await.unwrap()), vec![a.id.as_str()]);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_enqueue_and_remove_lose_nothing() {
    let (queue, _) = queue();
    let seeded: Vec<MutationRecord> = {
      let mut v = Vec::new();
      for i in 0..20 {
        v.push(queue.enqueue(MutationKind::Create, "listings", json!({"n": i})).await.unwrap());
      }
      v
    };

    let mut tasks = Vec::new();
    for i in 0..50 {
      let q = queue.clone();
      tasks.push(tokio::spawn(async move {
        q.enqueue(MutationKind::Update, "listings", json!({"n": 100 + i}))
          .await
          .map(|_| ())
      }));
    }
    for record in &seeded {
      let q = queue.clone();
      let id = record.id.clone();
      tasks.push(tokio::spawn(async move { q.remove(&id).await }));
    }
    for task in futures::future::join_all(tasks).await {
      task.unwrap().unwrap();
    }

    let remaining = queue.peek_all().await.unwrap();
    assert_eq!(remaining.len(), 50);
    assert!(remaining.iter().all(|r| r.kind == MutationKind::Update));
  }
}
