//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use catalog_sync::clock::ManualClock;
use catalog_sync::connectivity::{ConnectivityMonitor, ConnectivityState, TransportKind};
use catalog_sync::queue::MutationRecord;
use catalog_sync::store::MemoryStore;
use catalog_sync::sync::{applier_fn, DrainReport, RemoteApplier};
use catalog_sync::{OfflineClient, OfflineClientBuilder};
use color_eyre::eyre::eyre;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Records every mutation it is asked to apply. Payloads with `"fail": true`
/// are rejected.
#[derive(Clone, Default)]
pub struct Recorder {
  applied: Arc<Mutex<Vec<MutationRecord>>>,
  calls: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
  pub fn applier(&self) -> impl RemoteApplier + 'static {
    let applied = Arc::clone(&self.applied);
    let calls = Arc::clone(&self.calls);
    applier_fn(move |record: MutationRecord| {
      let applied = Arc::clone(&applied);
      let calls = Arc::clone(&calls);
      async move {
        calls.lock().unwrap().push(record.id.clone());
        if record.payload["fail"] == true {
          return Err(eyre!("500 Internal Server Error"));
        }
        applied.lock().unwrap().push(record);
        Ok(())
      }
    })
  }

  /// Ids applied successfully, in order.
  pub fn applied_ids(&self) -> Vec<String> {
    self.applied.lock().unwrap().iter().map(|r| r.id.clone()).collect()
  }

  pub fn applied(&self) -> Vec<MutationRecord> {
    self.applied.lock().unwrap().clone()
  }

  /// Ids attempted, successful or not, in order.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }
}

pub struct Harness {
  pub client: OfflineClient,
  pub monitor: ConnectivityMonitor,
  pub clock: ManualClock,
  pub store: MemoryStore,
  pub recorder: Recorder,
}

/// Client over an in-memory store and a manual clock, replaying into a
/// [`Recorder`].
pub fn harness() -> Harness {
  harness_with(|b| b)
}

pub fn harness_with(configure: impl FnOnce(OfflineClientBuilder) -> OfflineClientBuilder) -> Harness {
  let recorder = Recorder::default();
  harness_with_applier(Arc::new(recorder.applier()), recorder, configure)
}

pub fn harness_with_applier(
  applier: Arc<dyn RemoteApplier>,
  recorder: Recorder,
  configure: impl FnOnce(OfflineClientBuilder) -> OfflineClientBuilder,
) -> Harness {
  let store = MemoryStore::new();
  let monitor = ConnectivityMonitor::new(true);
  let clock = ManualClock::default();

  let builder = OfflineClient::builder(Arc::new(store.clone()), monitor.clone(), applier)
    .clock(Arc::new(clock.clone()));
  let client = configure(builder).build().unwrap();

  Harness {
    client,
    monitor,
    clock,
    store,
    recorder,
  }
}

pub fn go_offline(monitor: &ConnectivityMonitor) {
  monitor.report(ConnectivityState::offline());
}

pub fn go_online(monitor: &ConnectivityMonitor) {
  monitor.report(ConnectivityState::online(TransportKind::Wifi));
}

/// Wait for the next drain report, failing the test if none arrives.
pub async fn next_report(reports: &mut broadcast::Receiver<DrainReport>) -> DrainReport {
  tokio::time::timeout(Duration::from_secs(5), reports.recv())
    .await
    .expect("timed out waiting for a drain report")
    .expect("report channel closed")
}
