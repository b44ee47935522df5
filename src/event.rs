use catalog_sync::connectivity::Transition;
use catalog_sync::sync::DrainReport;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Events driving the `watch` loop
#[derive(Debug)]
pub enum Event {
  /// Reachability flipped
  Connectivity(Transition),
  /// A drain pass finished
  Drained(DrainReport),
  /// Periodic tick for status output
  Tick,
  /// Ctrl-C
  Shutdown,
}

/// Event handler that merges connectivity, drain reports, a tick timer and Ctrl-C
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn tick timer
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(tick_rate);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    // Spawn Ctrl-C listener
    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = shutdown_tx.send(Event::Shutdown);
      }
    });

    Self { tx, rx }
  }

  /// Sender for callbacks that push events in
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Forward drain reports into the event stream
  pub fn forward_reports(&self, mut reports: broadcast::Receiver<DrainReport>) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      loop {
        match reports.recv().await {
          Ok(report) => {
            if tx.send(Event::Drained(report)).is_err() {
              break;
            }
          }
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
