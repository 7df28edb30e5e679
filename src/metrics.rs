//! Process-wide counters, sampled by operators via snapshots.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters incremented on the hot paths; snapshot() is the read side.
#[derive(Debug, Default)]
pub struct Metrics {
  pub connection_total: AtomicI64,
  pub transaction_total: AtomicI64,
  pub command_total: AtomicU64,
  pub parse_command_errors: AtomicU64,
  pub load_errors: AtomicU64,
  pub transaction_errors: AtomicU64,
  pub send_event_errors: AtomicU64,
  pub report_events_errors: AtomicU64,
  pub drain_event_errors: AtomicU64,
}

impl Metrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn incr(&self, counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn connection_opened(&self) -> i64 {
    self.connection_total.fetch_add(1, Ordering::Relaxed) + 1
  }

  pub fn connection_closed(&self) -> i64 {
    self.connection_total.fetch_sub(1, Ordering::Relaxed) - 1
  }

  pub fn transaction_opened(&self) {
    self.transaction_total.fetch_add(1, Ordering::Relaxed);
  }

  pub fn transaction_closed(&self) {
    self.transaction_total.fetch_sub(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      connection_total: self.connection_total.load(Ordering::Relaxed),
      transaction_total: self.transaction_total.load(Ordering::Relaxed),
      command_total: self.command_total.load(Ordering::Relaxed),
      parse_command_errors: self.parse_command_errors.load(Ordering::Relaxed),
      load_errors: self.load_errors.load(Ordering::Relaxed),
      transaction_errors: self.transaction_errors.load(Ordering::Relaxed),
      send_event_errors: self.send_event_errors.load(Ordering::Relaxed),
      report_events_errors: self.report_events_errors.load(Ordering::Relaxed),
      drain_event_errors: self.drain_event_errors.load(Ordering::Relaxed),
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
  pub connection_total: i64,
  pub transaction_total: i64,
  pub command_total: u64,
  pub parse_command_errors: u64,
  pub load_errors: u64,
  pub transaction_errors: u64,
  pub send_event_errors: u64,
  pub report_events_errors: u64,
  pub drain_event_errors: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_connection_gauge() {
    let metrics = Metrics::new();
    assert_eq!(metrics.connection_opened(), 1);
    assert_eq!(metrics.connection_opened(), 2);
    assert_eq!(metrics.connection_closed(), 1);
    assert_eq!(metrics.snapshot().connection_total, 1);
  }

  #[test]
  fn test_error_counters() {
    let metrics = Metrics::new();
    metrics.incr(&metrics.report_events_errors);
    metrics.incr(&metrics.report_events_errors);
    metrics.incr(&metrics.send_event_errors);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.report_events_errors, 2);
    assert_eq!(snapshot.send_event_errors, 1);
  }
}
