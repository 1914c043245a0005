//! Time source for capture stamps and expiration checks.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
  fn now_millis(&self) -> i64;
}

/// Real time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_millis(&self) -> i64 {
    Utc::now().timestamp_millis()
  }
}

/// Clock that only moves when told to.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct ManualClock {
  now: AtomicI64,
}

#[allow(dead_code)]
impl ManualClock {
  pub fn new(start: i64) -> Self {
    Self {
      now: AtomicI64::new(start),
    }
  }

  pub fn set(&self, millis: i64) {
    self.now.store(millis, Ordering::SeqCst);
  }

  pub fn advance(&self, millis: i64) {
    self.now.fetch_add(millis, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_millis(&self) -> i64 {
    self.now.load(Ordering::SeqCst)
  }
}
