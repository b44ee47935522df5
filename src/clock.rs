//! Wall clock abstraction.
//!
//! Cache staleness and queue timestamps read the time through [`Clock`] so
//! tests can pin and advance it explicitly instead of sleeping.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  /// Create a clock frozen at the given instant.
  pub fn at(now: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(now)),
    }
  }

  /// Move the clock by `delta`. Negative deltas move it backwards.
  pub fn advance(&self, delta: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += delta;
  }

  /// Jump to an absolute instant.
  pub fn set(&self, to: DateTime<Utc>) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now = to;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::at(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}
