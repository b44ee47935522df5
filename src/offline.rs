//! Offline-first client: the public surface of the sync layer.
//!
//! [`OfflineClient`] ties the cache, the mutation queue, the sync engine and
//! the connectivity monitor together. Build one per process and hand it down
//! to whatever needs catalog data; it holds no global state.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{CacheLayer, CacheResult, CacheStore, QueryKey, ReadStrategy};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, Subscription, Transition};
use crate::error::{Result, SyncError};
use crate::queue::{MutationKind, MutationQueue, MutationRecord};
use crate::store::KeyValueStore;
use crate::sync::{DrainOutcome, DrainReport, RemoteApplier, SyncEngine};

/// What happened to a write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
  /// Applied to the remote side immediately.
  Applied,
  /// Stored in the mutation queue for a later drain.
  Queued(MutationRecord),
}

impl WriteOutcome {
  pub fn is_queued(&self) -> bool {
    matches!(self, WriteOutcome::Queued(_))
  }
}

/// Snapshot for status indicators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
  pub online: bool,
  pub last_sync_at: Option<DateTime<Utc>>,
  pub cached_count: usize,
  pub queued_count: usize,
  pub parked_count: usize,
}

/// Builder for [`OfflineClient`].
pub struct OfflineClientBuilder {
  store: Arc<dyn KeyValueStore>,
  monitor: ConnectivityMonitor,
  applier: Arc<dyn RemoteApplier>,
  clock: Arc<dyn Clock>,
  strategy: ReadStrategy,
  serve_stale: bool,
  max_attempts: Option<u32>,
  default_max_age: Duration,
  invalid: Option<String>,
}

impl OfflineClientBuilder {
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn strategy(mut self, strategy: ReadStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  pub fn serve_stale(mut self, serve_stale: bool) -> Self {
    self.serve_stale = serve_stale;
    self
  }

  pub fn max_attempts(mut self, max_attempts: Option<u32>) -> Self {
    self.max_attempts = max_attempts;
    self
  }

  pub fn default_max_age(mut self, max_age: Duration) -> Self {
    self.default_max_age = max_age;
    self
  }

  /// Take cache and sync settings from a loaded config.
  ///
  /// An out-of-range `cache.max_age_secs` makes [`build`](Self::build) fail.
  pub fn with_config(self, config: &Config) -> Self {
    let mut builder = self
      .strategy(config.cache.strategy)
      .serve_stale(config.cache.serve_stale)
      .max_attempts(config.sync.max_attempts);
    match Duration::try_seconds(config.cache.max_age_secs) {
      Some(max_age) => builder.default_max_age = max_age,
      None => {
        builder.invalid = Some(format!(
          "cache.max_age_secs {} is out of range",
          config.cache.max_age_secs
        ))
      }
    }
    builder
  }

  /// Build the client and hook reconnect drains onto the monitor.
  ///
  /// Must be called from within a tokio runtime.
  pub fn build(self) -> Result<OfflineClient> {
    if let Some(reason) = self.invalid {
      return Err(SyncError::Config(reason));
    }

    let cache = CacheStore::new(Arc::clone(&self.store), Arc::clone(&self.clock));
    let layer = CacheLayer::new(cache, self.monitor.clone())
      .with_strategy(self.strategy)
      .with_serve_stale(self.serve_stale);

    let queue = MutationQueue::new(Arc::clone(&self.store), Arc::clone(&self.clock));
    let engine = SyncEngine::new(queue, self.applier, Arc::clone(&self.clock))
      .with_max_attempts(self.max_attempts);
    let reconnect = engine.attach(&self.monitor)?;

    Ok(OfflineClient {
      layer,
      engine,
      monitor: self.monitor,
      default_max_age: self.default_max_age,
      _reconnect: reconnect,
    })
  }
}

/// Offline-first access to catalog data.
pub struct OfflineClient {
  layer: CacheLayer,
  engine: SyncEngine,
  monitor: ConnectivityMonitor,
  default_max_age: Duration,
  /// Keeps reconnect-triggered drains hooked up for the client's lifetime
  _reconnect: Subscription,
}

impl OfflineClient {
  /// Start building a client over `store`, watching `monitor`, replaying
  /// queued mutations through `applier`.
  pub fn builder(
    store: Arc<dyn KeyValueStore>,
    monitor: ConnectivityMonitor,
    applier: Arc<dyn RemoteApplier>,
  ) -> OfflineClientBuilder {
    OfflineClientBuilder {
      store,
      monitor,
      applier,
      clock: Arc::new(SystemClock),
      strategy: ReadStrategy::default(),
      serve_stale: true,
      max_attempts: None,
      default_max_age: Duration::minutes(5),
      invalid: None,
    }
  }

  pub fn monitor(&self) -> &ConnectivityMonitor {
    &self.monitor
  }

  pub fn default_max_age(&self) -> Duration {
    self.default_max_age
  }

  /// Read through the cache and return just the data.
  ///
  /// Fails with `NoCachedData` when neither the live fetch nor the cache can
  /// provide a value.
  pub async fn read_through<T, F, Fut>(&self, key: &str, max_age: Duration, fetcher: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>>,
  {
    Ok(self.read_through_with_source(key, max_age, fetcher).await?.data)
  }

  /// Read through the cache, reporting where the data came from.
  pub async fn read_through_with_source<T, F, Fut>(
    &self,
    key: &str,
    max_age: Duration,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>>,
  {
    self.layer.fetch(key, max_age, fetcher).await
  }

  /// Read through the cache keyed by a structured query.
  pub async fn read_query<Q, T, F, Fut>(
    &self,
    query: &Q,
    max_age: Duration,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    Q: QueryKey,
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>>,
  {
    self.layer.fetch_query(query, max_age, fetcher).await
  }

  /// Apply a write now if online, otherwise queue it.
  ///
  /// A failed immediate apply is queued too, so the write is never lost.
  /// Queued writes are retried by the next drain.
  pub async fn write_through<F, Fut>(
    &self,
    kind: MutationKind,
    target: &str,
    payload: Value,
    applier: F,
  ) -> Result<WriteOutcome>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<()>>,
  {
    if self.monitor.is_online() {
      match applier().await {
        Ok(()) => {
          debug!(%kind, collection = target, "write applied");
          return Ok(WriteOutcome::Applied);
        }
        Err(e) => {
          warn!(%kind, collection = target, error = %format!("{:#}", e), "write failed, queueing for later");
        }
      }
    }

    let record = self.engine.queue().enqueue(kind, target, payload).await?;
    Ok(WriteOutcome::Queued(record))
  }

  /// Queue a write without attempting it.
  pub async fn enqueue(
    &self,
    kind: MutationKind,
    target: &str,
    payload: Value,
  ) -> Result<MutationRecord> {
    self.engine.queue().enqueue(kind, target, payload).await
  }

  /// Drain the queue now. A no-op if a drain is already running.
  pub async fn force_sync(&self) -> Result<DrainOutcome> {
    self.engine.drain().await
  }

  /// Drop every cached entry. Queued mutations are untouched.
  pub async fn clear_cache(&self) -> Result<usize> {
    self.layer.cache().invalidate_all().await
  }

  pub async fn invalidate(&self, key: &str) -> Result<()> {
    self.layer.cache().invalidate(key).await
  }

  /// Drop cached entries whose key starts with `prefix`, e.g. a collection.
  pub async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
    self.layer.cache().invalidate_prefix(prefix).await
  }

  pub async fn status(&self) -> Result<SyncStatus> {
    let queue = self.engine.queue();
    let (cached_count, queued_count, parked) =
      futures::try_join!(self.layer.cache().count(), queue.len(), queue.parked())?;
    Ok(SyncStatus {
      online: self.monitor.is_online(),
      last_sync_at: self.engine.last_sync_at(),
      cached_count,
      queued_count,
      parked_count: parked.len(),
    })
  }

  /// Be told about connectivity flips, e.g. to drive an offline banner.
  pub fn subscribe_connectivity<F>(&self, callback: F) -> Subscription
  where
    F: Fn(Transition) + Send + Sync + 'static,
  {
    self.monitor.subscribe(callback)
  }

  /// Receive a report after every drain pass.
  pub fn drain_reports(&self) -> broadcast::Receiver<DrainReport> {
    self.engine.reports()
  }

  pub fn is_syncing(&self) -> bool {
    self.engine.is_draining()
  }

  pub async fn pending(&self) -> Result<Vec<MutationRecord>> {
    self.engine.queue().peek_all().await
  }

  pub async fn parked(&self) -> Result<Vec<MutationRecord>> {
    self.engine.queue().parked().await
  }

  /// Drop a pending or parked mutation for good.
  pub async fn purge(&self, id: &str) -> Result<bool> {
    self.engine.queue().purge(id).await
  }

  /// Give parked mutations another round of attempts.
  pub async fn requeue_parked(&self) -> Result<usize> {
    self.engine.queue().requeue_parked().await
  }
}
