//! Event model and pipeline boundary tests

use chrono::{DateTime, Utc};
use roomdb::config::{EventReportSection, EventServiceSection};
use roomdb::events::{AccessMode, EventError, EventService, HashTagEvent};
use roomdb::Metrics;
use std::collections::BTreeSet;
use std::sync::Arc;

fn at(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap()
}

fn event(hash_tag: &str, keys: &[&str], mode: AccessMode, time_ms: i64) -> HashTagEvent {
  let keys: BTreeSet<String> = keys.iter().map(|k| k.to_string()).collect();
  HashTagEvent::new(hash_tag.to_string(), keys, mode, at(time_ms)).unwrap()
}

fn service(buffer_limit: usize) -> Arc<EventService> {
  EventService::new(
    EventServiceSection {
      buffer_limit,
      agg_interval_ms: 60_000,
      drain_duration_ms: 100,
      event_report: EventReportSection {
        url: "http://127.0.0.1:1/events".to_string(),
        ..EventReportSection::default()
      },
    },
    Arc::new(Metrics::new()),
  )
  .unwrap()
}

// =============================================================================
// Event invariants
// =============================================================================

#[test]
fn test_event_requires_hash_tag_keys_and_time() {
  assert!(matches!(
    HashTagEvent::new("".to_string(), ["k".to_string()].into(), AccessMode::Read, at(1)),
    Err(EventError::EmptyHashTag)
  ));
  assert!(matches!(
    HashTagEvent::new("t".to_string(), BTreeSet::new(), AccessMode::Write, at(1)),
    Err(EventError::NoKeys)
  ));
  assert!(matches!(
    HashTagEvent::new("t".to_string(), ["k".to_string()].into(), AccessMode::Read, at(0)),
    Err(EventError::EmptyAccessTime)
  ));
}

#[test]
fn test_keys_are_deduplicated() {
  let keys = vec!["k1".to_string(), "k1".to_string(), "k2".to_string()];
  let event = HashTagEvent::from_keys("t", &keys, AccessMode::Read, at(1)).unwrap();
  assert_eq!(event.keys().len(), 2);
}

// =============================================================================
// Merge laws
// =============================================================================

#[test]
fn test_merge_laws() {
  let mut merged = event("t", &["k1"], AccessMode::Read, 100);
  merged.merge(event("t", &["k2"], AccessMode::Write, 200));
  merged.merge(event("t", &["k1"], AccessMode::Read, 150));

  assert_eq!(merged.access_mode(), AccessMode::Write);
  assert_eq!(merged.access_time(), at(200));
  let keys: Vec<&str> = merged.keys().iter().map(|k| k.as_str()).collect();
  assert_eq!(keys, vec!["k1", "k2"]);
}

#[test]
fn test_merge_commutes() {
  let a = event("t", &["k1"], AccessMode::Write, 300);
  let b = event("t", &["k2"], AccessMode::Read, 100);

  let mut ab = a.clone();
  ab.merge(b.clone());
  let mut ba = b;
  ba.merge(a);

  assert_eq!(ab, ba);
}

// =============================================================================
// Pipeline boundaries
// =============================================================================

#[tokio::test]
async fn test_buffer_full_drops_without_blocking() {
  let service = service(2);
  let keys = vec!["{t}:k".to_string()];

  service.send_event("t", &keys, AccessMode::Read, at(1)).unwrap();
  service.send_event("t", &keys, AccessMode::Read, at(2)).unwrap();
  let err = service
    .send_event("t", &keys, AccessMode::Read, at(3))
    .unwrap_err();
  assert!(matches!(err, EventError::BufferFull { limit: 2 }));
}

#[tokio::test]
async fn test_stop_twice_is_safe() {
  let service = service(8);
  service.start();
  service
    .send_event("t", &["{t}:k".to_string()], AccessMode::Write, at(1))
    .unwrap();
  service.stop().await;
  service.stop().await;
}
