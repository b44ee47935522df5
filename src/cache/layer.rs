//! Cache layer that orchestrates caching logic with network fetching.

use chrono::Duration;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, warn};

use super::storage::CacheStore;
use super::traits::{CacheResult, QueryKey};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};

/// Order in which a read consults the network and the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStrategy {
  /// Always try the live fetch when online; the cache is only a fallback.
  #[default]
  NetworkFirst,
  /// Serve a fresh cache entry without touching the network.
  CacheFirst,
}

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the application and the network client,
/// providing transparent caching with offline support.
#[derive(Clone)]
pub struct CacheLayer {
  cache: CacheStore,
  monitor: ConnectivityMonitor,
  strategy: ReadStrategy,
  /// Serve entries past their max age when the live path fails
  serve_stale: bool,
}

impl CacheLayer {
  /// Create a new cache layer over `cache`, gated by `monitor`.
  pub fn new(cache: CacheStore, monitor: ConnectivityMonitor) -> Self {
    Self {
      cache,
      monitor,
      strategy: ReadStrategy::default(),
      serve_stale: true,
    }
  }

  pub fn with_strategy(mut self, strategy: ReadStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  pub fn with_serve_stale(mut self, serve_stale: bool) -> Self {
    self.serve_stale = serve_stale;
    self
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  /// Fetch through the cache.
  ///
  /// 1. With `CacheFirst`, a fresh entry is returned immediately
  /// 2. If online, fetch from network, refresh the cache and return
  /// 3. On network failure or when offline, fall back to the cache
  /// 4. With nothing cached, fail with `NoCachedData`
  pub async fn fetch<T, F, Fut>(
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
    if self.strategy == ReadStrategy::CacheFirst {
      if let Some(entry) = self.cache.read_entry::<T>(key).await? {
        if self.cache.is_fresh(entry.written_at, max_age) {
          // Cache is fresh, return immediately
          debug!(key, "serving fresh cache entry");
          return Ok(CacheResult::from_cache(entry.payload, entry.written_at, false));
        }
      }
    }

    let online = self.monitor.is_online();
    let mut cause = None;

    if online {
      match fetcher().await {
        Ok(data) => {
          // Update cache with fresh data. The data is still good if this fails.
          if let Err(e) = self.cache.write(key, &data).await {
            warn!(key, error = %e, "failed to refresh cache entry");
          }
          return Ok(CacheResult::from_network(data));
        }
        Err(e) => {
          warn!(key, error = %format!("{:#}", e), "live fetch failed, falling back to cache");
          cause = Some(format!("{:#}", e));
        }
      }
    } else {
      debug!(key, "offline, skipping live fetch");
    }

    self.fallback(key, max_age, online, cause).await
  }

  /// Fetch using a structured query key.
  pub async fn fetch_query<Q, T, F, Fut>(
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
    debug!(query = %query.description(), "read-through query");
    self.fetch(&query.cache_hash(), max_age, fetcher).await
  }

  async fn fallback<T: DeserializeOwned>(
    &self,
    key: &str,
    max_age: Duration,
    online: bool,
    cause: Option<String>,
  ) -> Result<CacheResult<T>> {
    let no_data = || SyncError::NoCachedData {
      key: key.to_string(),
      cause: cause.clone(),
    };

    let Some(entry) = self.cache.read_entry::<T>(key).await? else {
      return Err(no_data());
    };

    if self.cache.is_fresh(entry.written_at, max_age) {
      return Ok(CacheResult::from_cache(entry.payload, entry.written_at, false));
    }
    if !self.serve_stale {
      return Err(no_data());
    }

    if online {
      // Network failed, return stale cache
      Ok(CacheResult::from_cache(entry.payload, entry.written_at, true))
    } else {
      Ok(CacheResult::offline(entry.payload, entry.written_at))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::clock::ManualClock;
  use crate::connectivity::ConnectivityState;
  use crate::store::MemoryStore;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  struct Fixture {
    layer: CacheLayer,
    monitor: ConnectivityMonitor,
    clock: ManualClock,
  }

  fn fixture() -> Fixture {
    let clock = ManualClock::default();
    let cache = CacheStore::new(Arc::new(MemoryStore::new()), Arc::new(clock.clone()));
    let monitor = ConnectivityMonitor::new(true);
    Fixture {
      layer: CacheLayer::new(cache, monitor.clone()),
      monitor,
      clock,
    }
  }

  #[tokio::test]
  async fn network_first_fetches_and_caches() {
    let f = fixture();
    let result = f
      .layer
      .fetch("k", Duration::minutes(1), || async { Ok(vec!["a".to_string()]) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(f.layer.cache().count().await.unwrap(), 1);

    // Network-first still goes to the network with a fresh entry present
    let result = f
      .layer
      .fetch("k", Duration::minutes(1), || async { Ok(vec!["b".to_string()]) })
      .await
      .unwrap();
    assert_eq!(result.data, vec!["b".to_string()]);
  }

  #[tokio::test]
  async fn cache_first_skips_network_while_fresh() {
    let f = fixture();
    let layer = f.layer.clone().with_strategy(ReadStrategy::CacheFirst);
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
      let result = layer
        .fetch("k", Duration::minutes(1), || async {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(42)
        })
        .await
        .unwrap();
      assert_eq!(result.data, 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    f.clock.advance(Duration::minutes(2));
    let result = layer
      .fetch("k", Duration::minutes(1), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(43)
      })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn failed_fetch_serves_stale_entry() {
    let f = fixture();
    f.layer.cache().write("k", &"old").await.unwrap();
    f.clock.advance(Duration::hours(1));

    let result = f
      .layer
      .fetch::<String, _, _>("k", Duration::minutes(1), || async { Err(eyre!("timeout")) })
      .await
      .unwrap();
    assert_eq!(result.data, "old");
    assert_eq!(result.source, CacheSource::CacheStale);
    assert!(result.cached_at.is_some());
  }

  #[tokio::test]
  async fn stale_fallback_can_be_disabled() {
    let f = fixture();
    let layer = f.layer.clone().with_serve_stale(false);
    layer.cache().write("k", &"old").await.unwrap();
    f.clock.advance(Duration::hours(1));

    let err = layer
      .fetch::<String, _, _>("k", Duration::minutes(1), || async { Err(eyre!("timeout")) })
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::NoCachedData { .. }));
  }

  #[tokio::test]
  async fn offline_reads_never_call_fetcher() {
    let f = fixture();
    f.layer.cache().write("k", &7).await.unwrap();
    f.clock.advance(Duration::hours(1));
    f.monitor.report(ConnectivityState::offline());

    let calls = AtomicUsize::new(0);
    let result = f
      .layer
      .fetch("k", Duration::minutes(1), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
      })
      .await
      .unwrap();
    assert_eq!(result.data, 7);
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let err = f
      .layer
      .fetch::<i32, _, _>("missing", Duration::minutes(1), || async { Ok(1) })
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::NoCachedData { cause: None, .. }));
  }
}
