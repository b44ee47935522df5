//! Remote-apply callbacks used to replay queued mutations.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::queue::MutationRecord;

/// Applies one queued mutation on the remote side.
///
/// Implementations must be idempotent: a record may be applied again after a
/// crash between the remote accepting it and the queue dropping it.
#[async_trait]
pub trait RemoteApplier: Send + Sync {
  async fn apply(&self, record: &MutationRecord) -> Result<()>;
}

/// Applier backed by an async closure.
pub struct FnApplier<F> {
  f: F,
}

/// Wrap an async closure as a [`RemoteApplier`].
pub fn applier_fn<F, Fut>(f: F) -> FnApplier<F>
where
  F: Fn(MutationRecord) -> Fut + Send + Sync,
  Fut: Future<Output = Result<()>> + Send,
{
  FnApplier { f }
}

#[async_trait]
impl<F, Fut> RemoteApplier for FnApplier<F>
where
  F: Fn(MutationRecord) -> Fut + Send + Sync,
  Fut: Future<Output = Result<()>> + Send,
{
  async fn apply(&self, record: &MutationRecord) -> Result<()> {
    (self.f)(record.clone()).await
  }
}

/// Dispatches records to per-collection appliers by `target`.
#[derive(Default, Clone)]
pub struct ApplierRegistry {
  appliers: HashMap<String, Arc<dyn RemoteApplier>>,
  fallback: Option<Arc<dyn RemoteApplier>>,
}

impl ApplierRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Route records for `target` to `applier`.
  pub fn register(mut self, target: impl Into<String>, applier: impl RemoteApplier + 'static) -> Self {
    self.appliers.insert(target.into(), Arc::new(applier));
    self
  }

  /// Route records with no registered target to `applier`.
  pub fn with_fallback(mut self, applier: impl RemoteApplier + 'static) -> Self {
    self.fallback = Some(Arc::new(applier));
    self
  }

  pub fn targets(&self) -> impl Iterator<Item = &str> {
    self.appliers.keys().map(String::as_str)
  }
}

#[async_trait]
impl RemoteApplier for ApplierRegistry {
  async fn apply(&self, record: &MutationRecord) -> Result<()> {
    let applier = self
      .appliers
      .get(&record.target)
      .or(self.fallback.as_ref())
      .ok_or_else(|| eyre!("No applier registered for target {}", record.target))?;
    applier.apply(record).await
  }
}
