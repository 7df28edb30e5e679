//! The access event type and its invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a hash tag was touched. Write dominates under merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
  Read,
  Write,
}

impl std::fmt::Display for AccessMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      AccessMode::Read => write!(f, "read"),
      AccessMode::Write => write!(f, "write"),
    }
  }
}

impl std::str::FromStr for AccessMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "read" => Ok(AccessMode::Read),
      "write" => Ok(AccessMode::Write),
      _ => Err(format!("unknown access mode: {}", s)),
    }
  }
}

/// One access to the keys of a hash tag. Invariants hold from construction
/// through every merge: non-empty hash tag, non-empty deduplicated key set,
/// non-zero access time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashTagEvent {
  hash_tag: String,
  keys: BTreeSet<String>,
  access_mode: AccessMode,
  access_time: DateTime<Utc>,
}

impl HashTagEvent {
  pub fn new(
    hash_tag: String,
    keys: BTreeSet<String>,
    access_mode: AccessMode,
    access_time: DateTime<Utc>,
  ) -> Result<Self, EventError> {
    if hash_tag.is_empty() {
      return Err(EventError::EmptyHashTag);
    }
    if keys.is_empty() {
      return Err(EventError::NoKeys);
    }
    if access_time.timestamp_millis() == 0 {
      return Err(EventError::EmptyAccessTime);
    }
    Ok(Self {
      hash_tag,
      keys,
      access_mode,
      access_time,
    })
  }

  pub fn from_keys(
    hash_tag: &str,
    keys: &[String],
    access_mode: AccessMode,
    access_time: DateTime<Utc>,
  ) -> Result<Self, EventError> {
    Self::new(
      hash_tag.to_string(),
      keys.iter().cloned().collect(),
      access_mode,
      access_time,
    )
  }

  pub fn hash_tag(&self) -> &str {
    &self.hash_tag
  }

  pub fn keys(&self) -> &BTreeSet<String> {
    &self.keys
  }

  pub fn access_mode(&self) -> AccessMode {
    self.access_mode
  }

  pub fn access_time(&self) -> DateTime<Utc> {
    self.access_time
  }

  /// Merge another event for the same hash tag into this one: key sets
  /// union, access time is max-wins, and write mode dominates. The merge is
  /// commutative up to these laws.
  pub fn merge(&mut self, other: HashTagEvent) {
    self.keys.extend(other.keys);
    if other.access_time > self.access_time {
      self.access_time = other.access_time;
    }
    if other.access_mode == AccessMode::Write {
      self.access_mode = AccessMode::Write;
    }
  }
}

impl std::fmt::Display for HashTagEvent {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let keys: Vec<&str> = self.keys.iter().map(|k| k.as_str()).collect();
    write!(
      f,
      "Event[hash_tag={}, access_mode={}, access_time={}, keys={}]",
      self.hash_tag,
      self.access_mode,
      self.access_time.to_rfc3339(),
      keys.join(" ")
    )
  }
}

#[derive(Debug, Clone)]
pub enum EventError {
  EmptyHashTag,
  NoKeys,
  EmptyAccessTime,
  /// The ingress buffer was at capacity; the event was dropped.
  BufferFull { limit: usize },
  /// The service has been stopped; the event was dropped.
  Stopped,
  DrainTimeout,
  Client(String),
  Transport(String),
  BadStatus { code: u16, body: String },
}

impl std::fmt::Display for EventError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EventError::EmptyHashTag => write!(f, "event hash_tag is empty"),
      EventError::NoKeys => write!(f, "event contains no keys"),
      EventError::EmptyAccessTime => write!(f, "event access_time is empty"),
      EventError::BufferFull { limit } => write!(
        f,
        "event service buffer is full with limit {}, event is discarded",
        limit
      ),
      EventError::Stopped => write!(f, "event service is stopped, event is discarded"),
      EventError::DrainTimeout => write!(f, "drain event timeout"),
      EventError::Client(msg) => write!(f, "http client error: {}", msg),
      EventError::Transport(msg) => write!(f, "report request error: {}", msg),
      EventError::BadStatus { code, body } => {
        write!(f, "response error, http_code={}, body={}", code, body)
      }
    }
  }
}

impl std::error::Error for EventError {}

#[cfg(test)]
mod tests {
  use super::*;

  fn at(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
  }

  fn event(keys: &[&str], mode: AccessMode, time_ms: i64) -> HashTagEvent {
    HashTagEvent::new(
      "t".to_string(),
      keys.iter().map(|k| k.to_string()).collect(),
      mode,
      at(time_ms),
    )
    .unwrap()
  }

  #[test]
  fn test_constructor_invariants() {
    assert!(matches!(
      HashTagEvent::new("".to_string(), ["k".to_string()].into(), AccessMode::Read, at(1)),
      Err(EventError::EmptyHashTag)
    ));
    assert!(matches!(
      HashTagEvent::new("t".to_string(), BTreeSet::new(), AccessMode::Read, at(1)),
      Err(EventError::NoKeys)
    ));
    assert!(matches!(
      HashTagEvent::new("t".to_string(), ["k".to_string()].into(), AccessMode::Read, at(0)),
      Err(EventError::EmptyAccessTime)
    ));
  }

  #[test]
  fn test_merge_unions_keys_and_write_dominates() {
    let mut merged = event(&["k1"], AccessMode::Read, 100);
    merged.merge(event(&["k2"], AccessMode::Write, 200));
    merged.merge(event(&["k1"], AccessMode::Read, 150));

    assert_eq!(merged.access_mode(), AccessMode::Write);
    assert_eq!(merged.access_time(), at(200));
    let keys: Vec<&str> = merged.keys().iter().map(|k| k.as_str()).collect();
    assert_eq!(keys, vec!["k1", "k2"]);
  }

  #[test]
  fn test_merge_is_order_independent() {
    let a = event(&["k1"], AccessMode::Read, 100);
    let b = event(&["k2"], AccessMode::Write, 50);

    let mut ab = a.clone();
    ab.merge(b.clone());
    let mut ba = b;
    ba.merge(a);

    assert_eq!(ab, ba);
  }

  #[test]
  fn test_serde_shape() {
    let ev = event(&["k1", "k2"], AccessMode::Write, 1_700_000_000_000);
    let json = serde_json::to_value(&ev).unwrap();
    assert_eq!(json["hash_tag"], "t");
    assert_eq!(json["access_mode"], "write");
    assert_eq!(json["keys"], serde_json::json!(["k1", "k2"]));
    assert!(json["access_time"].is_string());
  }
}
