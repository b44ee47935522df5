//! Replays queued mutations against the remote side.
//!
//! The engine drains the mutation queue in FIFO order whenever connectivity
//! comes back or a caller forces a sync. At most one drain runs at a time;
//! triggers that arrive mid-drain are dropped rather than queued.
//!
//! A failing record never blocks the ones behind it. It stays queued with its
//! attempt counter bumped, and is retried on the next trigger. No retry timer
//! is scheduled here, and no timeout is imposed on the applier: an applier that
//! never returns stalls its drain pass.

mod applier;

pub use applier::{applier_fn, ApplierRegistry, FnApplier, RemoteApplier};

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::error::{Result, SyncError};
use crate::queue::MutationQueue;

/// A record that failed during a drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMutation {
  pub id: String,
  pub target: String,
  pub error: String,
  /// Attempts including this one
  pub attempts: u32,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
  /// Records in the snapshot taken at drain start
  pub attempted: usize,
  /// Ids applied and removed, in replay order
  pub applied: Vec<String>,
  pub failed: Vec<FailedMutation>,
  /// Ids moved to the parked list during this pass
  pub parked: Vec<String>,
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
}

impl DrainReport {
  pub fn is_clean(&self) -> bool {
    self.failed.is_empty()
  }
}

/// What a drain trigger did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  /// Another drain was in progress; nothing ran.
  AlreadyRunning,
  Completed(DrainReport),
}

impl DrainOutcome {
  pub fn report(&self) -> Option<&DrainReport> {
    match self {
      DrainOutcome::Completed(report) => Some(report),
      DrainOutcome::AlreadyRunning => None,
    }
  }
}

struct EngineInner {
  queue: MutationQueue,
  applier: Arc<dyn RemoteApplier>,
  clock: Arc<dyn Clock>,
  /// Single-flight guard: only one drain can run at a time
  draining: AtomicBool,
  last_sync_at: Mutex<Option<DateTime<Utc>>>,
  reports: broadcast::Sender<DrainReport>,
}

/// Single-flight drain of the mutation queue.
///
/// Cheap to clone; clones share the guard and state.
#[derive(Clone)]
pub struct SyncEngine {
  inner: Arc<EngineInner>,
  /// Park a record once it has failed this many times
  max_attempts: Option<u32>,
}

/// Releases the single-flight flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl SyncEngine {
  pub fn new(queue: MutationQueue, applier: Arc<dyn RemoteApplier>, clock: Arc<dyn Clock>) -> Self {
    let (reports, _) = broadcast::channel(16);
    Self {
      inner: Arc::new(EngineInner {
        queue,
        applier,
        clock,
        draining: AtomicBool::new(false),
        last_sync_at: Mutex::new(None),
        reports,
      }),
      max_attempts: None,
    }
  }

  /// Park records after `max_attempts` failures. `None` or zero never parks.
  pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
    self.max_attempts = max_attempts.filter(|m| *m > 0);
    self
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.inner.queue
  }

  /// Check if a drain is currently running.
  pub fn is_draining(&self) -> bool {
    self.inner.draining.load(Ordering::SeqCst)
  }

  pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
    *self.inner.last_sync_at.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Receive a report after every completed drain pass.
  pub fn reports(&self) -> broadcast::Receiver<DrainReport> {
    self.inner.reports.subscribe()
  }

  /// Drain the queue once.
  ///
  /// Returns `AlreadyRunning` without doing anything if another drain holds
  /// the guard. Storage errors abort the pass and propagate; apply failures
  /// are recorded on the record and the pass moves on.
  pub async fn drain(&self) -> Result<DrainOutcome> {
    // Acquire the single-flight guard.
    if self
      .inner
      .draining
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      info!("drain already in progress, ignoring trigger");
      return Ok(DrainOutcome::AlreadyRunning);
    }
    let _guard = DrainGuard(&self.inner.draining);

    let report = self.run_pass().await?;

    *self.inner.last_sync_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.finished_at);
    // No receivers is fine
    let _ = self.inner.reports.send(report.clone());

    Ok(DrainOutcome::Completed(report))
  }

  async fn run_pass(&self) -> Result<DrainReport> {
    let queue = &self.inner.queue;
    let started_at = self.inner.clock.now();

    // Records enqueued after this point wait for the next trigger
    let snapshot = queue.peek_all().await?;
    if !snapshot.is_empty() {
      info!(queued = snapshot.len(), "drain started");
    }

    let mut applied = Vec::new();
    let mut failed = Vec::new();
    let mut parked = Vec::new();

    for record in &snapshot {
      match self.inner.applier.apply(record).await {
        Ok(()) => {
          queue.remove(&record.id).await?;
          applied.push(record.id.clone());
        }
        Err(e) => {
          let reason = format!("{:#}", e);
          let err = SyncError::RemoteApplyFailed {
            id: record.id.clone(),
            reason: reason.clone(),
          };
          let attempts = match queue.record_failure(&record.id, &reason).await? {
            Some(updated) => updated.attempts,
            // Purged while the applier ran
            None => record.attempts + 1,
          };
          warn!(collection = %record.target, kind = %record.kind, attempts, error = %err, "mutation left queued");

          if self.max_attempts.is_some_and(|max| attempts >= max)
            && queue.park(&record.id).await?
          {
            parked.push(record.id.clone());
          }

          failed.push(FailedMutation {
            id: record.id.clone(),
            target: record.target.clone(),
            error: reason,
            attempts,
          });
        }
      }
    }

    let report = DrainReport {
      attempted: snapshot.len(),
      applied,
      failed,
      parked,
      started_at,
      finished_at: self.inner.clock.now(),
    };

    if report.attempted > 0 {
      info!(
        attempted = report.attempted,
        applied = report.applied.len(),
        failed = report.failed.len(),
        parked = report.parked.len(),
        "drain finished"
      );
    }
    Ok(report)
  }

  /// Drain automatically whenever `monitor` reports an offline to online flip.
  ///
  /// Must be called from within a tokio runtime; drains are spawned onto it.
  /// The hook stays active while the returned subscription lives.
  pub fn attach(&self, monitor: &ConnectivityMonitor) -> Result<Subscription> {
    let handle = tokio::runtime::Handle::try_current()
      .map_err(|e| SyncError::Runtime(format!("no tokio runtime to run drains on: {}", e)))?;
    let engine = self.clone();

    Ok(monitor.subscribe(move |transition| {
      if !transition.went_online() {
        return;
      }
      let engine = engine.clone();
      handle.spawn(async move {
        if let Err(e) = engine.drain().await {
          error!(error = %e, "drain after reconnect failed");
        }
      });
    }))
  }
}
