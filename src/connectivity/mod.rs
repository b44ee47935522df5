//! Connectivity monitoring.
//!
//! The monitor holds the last known reachability and notifies subscribers when
//! `reachable` flips. Repeated identical reports are swallowed, so subscribers
//! only ever see edges.

mod probe;

pub use probe::{HttpProbe, ReachabilityProbe};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Coarse transport classification. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
  Wifi,
  Cellular,
  Ethernet,
  None,
  Unknown,
}

/// Point-in-time reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
  pub reachable: bool,
  pub transport: TransportKind,
}

impl ConnectivityState {
  pub fn online(transport: TransportKind) -> Self {
    Self {
      reachable: true,
      transport,
    }
  }

  pub fn offline() -> Self {
    Self {
      reachable: false,
      transport: TransportKind::None,
    }
  }

  /// Assumed state before the first probe resolves.
  pub fn optimistic() -> Self {
    Self::online(TransportKind::Unknown)
  }
}

/// A flip of `reachable`, delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
  pub previous: ConnectivityState,
  pub current: ConnectivityState,
}

impl Transition {
  pub fn went_online(&self) -> bool {
    !self.previous.reachable && self.current.reachable
  }

  pub fn went_offline(&self) -> bool {
    self.previous.reachable && !self.current.reachable
  }
}

type Callback = Arc<dyn Fn(Transition) + Send + Sync>;

struct MonitorInner {
  state: RwLock<ConnectivityState>,
  subscribers: Mutex<Vec<(u64, Callback)>>,
  next_id: AtomicU64,
  fail_open: bool,
}

/// Observes reachability and fans out transitions.
///
/// Cheap to clone; clones share state and subscribers.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
  /// Create a monitor reporting the optimistic default until told otherwise.
  ///
  /// `fail_open` decides what a failing probe means: reachable (true) or not.
  pub fn new(fail_open: bool) -> Self {
    Self {
      inner: Arc::new(MonitorInner {
        state: RwLock::new(ConnectivityState::optimistic()),
        subscribers: Mutex::new(Vec::new()),
        next_id: AtomicU64::new(0),
        fail_open,
      }),
    }
  }

  pub fn fail_open(&self) -> bool {
    self.inner.fail_open
  }

  pub fn current_state(&self) -> ConnectivityState {
    *self.inner.state.read().unwrap_or_else(|e| e.into_inner())
  }

  pub fn is_online(&self) -> bool {
    self.current_state().reachable
  }

  /// Register a callback fired on every reachability flip.
  ///
  /// The callback stays registered while the returned [`Subscription`] lives.
  /// It runs on whichever task reported the change and must not block.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(Transition) + Send + Sync + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .inner
      .subscribers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push((id, Arc::new(callback)));

    Subscription {
      id,
      monitor: Arc::downgrade(&self.inner),
    }
  }

  /// Record a new observation from the platform.
  ///
  /// Returns the transition if `reachable` changed.
  pub fn report(&self, state: ConnectivityState) -> Option<Transition> {
    let transition = {
      let mut current = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
      let previous = *current;
      *current = state;
      (previous.reachable != state.reachable).then_some(Transition {
        previous,
        current: state,
      })
    };

    if let Some(transition) = transition {
      info!(
        reachable = transition.current.reachable,
        transport = ?transition.current.transport,
        "connectivity changed"
      );
      self.notify(transition);
    }
    transition
  }

  /// Record that the reachability primitive itself failed.
  pub fn report_probe_error(&self, error: &str) -> Option<Transition> {
    warn!(error, fail_open = self.inner.fail_open, "reachability probe failed");
    self.report(ConnectivityState {
      reachable: self.inner.fail_open,
      transport: TransportKind::Unknown,
    })
  }

  /// Run one probe and apply its result.
  pub async fn probe_once(&self, probe: &dyn ReachabilityProbe) -> ConnectivityState {
    match probe.probe().await {
      Ok(state) => {
        self.report(state);
      }
      Err(e) => {
        self.report_probe_error(&format!("{:#}", e));
      }
    }
    self.current_state()
  }

  /// Probe eagerly, then keep probing every `interval`.
  ///
  /// Polling stops when the returned handle is dropped.
  pub fn spawn_polling(
    &self,
    probe: Arc<dyn ReachabilityProbe>,
    interval: Duration,
  ) -> PollingHandle {
    let monitor = self.clone();
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        // First tick completes immediately, which gives us the eager probe
        ticker.tick().await;
        monitor.probe_once(probe.as_ref()).await;
      }
    });
    PollingHandle { task }
  }

  fn notify(&self, transition: Transition) {
    // Clone out so callbacks may subscribe or unsubscribe without deadlocking
    let callbacks: Vec<Callback> = self
      .inner
      .subscribers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .map(|(_, cb)| Arc::clone(cb))
      .collect();

    for callback in callbacks {
      callback(transition);
    }
  }
}

/// Handle keeping a connectivity callback registered.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
  id: u64,
  monitor: Weak<MonitorInner>,
}

impl Subscription {
  /// Detach the callback now.
  pub fn unsubscribe(self) {
    drop(self)
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.monitor.upgrade() {
      inner
        .subscribers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .retain(|(id, _)| *id != self.id);
    }
  }
}

/// Background polling task. Aborted on drop.
pub struct PollingHandle {
  task: JoinHandle<()>,
}

impl PollingHandle {
  pub fn stop(self) {
    drop(self)
  }
}

impl Drop for PollingHandle {
  fn drop(&mut self) {
    self.task.abort();
  }
}
