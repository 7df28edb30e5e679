//! Persisted value records: one key's state at persistence time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Supported cache data kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
  String,
  List,
  Hash,
  Set,
  Zset,
}

impl std::fmt::Display for ValueKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ValueKind::String => write!(f, "string"),
      ValueKind::List => write!(f, "list"),
      ValueKind::Hash => write!(f, "hash"),
      ValueKind::Set => write!(f, "set"),
      ValueKind::Zset => write!(f, "zset"),
    }
  }
}

impl std::str::FromStr for ValueKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "string" => Ok(ValueKind::String),
      "list" => Ok(ValueKind::List),
      "hash" => Ok(ValueKind::Hash),
      "set" => Ok(ValueKind::Set),
      "zset" => Ok(ValueKind::Zset),
      _ => Err(format!("unsupported value kind: {}", s)),
    }
  }
}

/// Unknown or empty kind tags decode to the zero sentinel; the loader skips
/// them.
fn deserialize_kind<'de, D>(deserializer: D) -> Result<Option<ValueKind>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let tag = Option::<String>::deserialize(deserializer)?;
  Ok(tag.and_then(|tag| tag.parse().ok()))
}

/// One member of a persisted sorted set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZsetMember {
  pub member: String,
  pub score: f64,
}

/// A persisted value record: kind tag, opaque serialized payload, last-synced
/// and expiry timestamps in milliseconds. `kind: None` is the zero sentinel
/// signalling absence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedisValue {
  #[serde(
    rename = "type",
    default,
    skip_serializing_if = "Option::is_none",
    deserialize_with = "deserialize_kind"
  )]
  pub kind: Option<ValueKind>,
  #[serde(default)]
  pub value: String,
  #[serde(default)]
  pub synced_ts: i64,
  #[serde(default)]
  pub expire_ts: i64,
}

impl RedisValue {
  pub fn new(kind: ValueKind, value: String, synced_ts: i64, expire_ts: i64) -> Self {
    Self {
      kind: Some(kind),
      value,
      synced_ts,
      expire_ts,
    }
  }

  /// The zero sentinel: no kind, signals absence.
  pub fn zero() -> Self {
    Self::default()
  }

  pub fn is_zero(&self) -> bool {
    self.kind.is_none()
  }

  /// A value is expired when its expiry is set and not after `now_ms`.
  pub fn is_expired(&self, now_ms: i64) -> bool {
    if self.expire_ts == 0 || now_ms == 0 {
      return false;
    }
    self.expire_ts <= now_ms
  }

  /// Remaining lifetime in milliseconds: -1 without expiry, 0 when already
  /// expired, positive remainder otherwise.
  pub fn ttl(&self, now_ms: i64) -> i64 {
    if self.expire_ts == 0 {
      return -1;
    }
    let remaining = self.expire_ts - now_ms;
    if remaining < 0 {
      return 0;
    }
    remaining
  }

  /// Decode the payload of a list record.
  pub fn decode_list(&self) -> Result<Vec<String>, serde_json::Error> {
    serde_json::from_str(&self.value)
  }

  /// Decode the payload of a hash record.
  pub fn decode_hash(&self) -> Result<HashMap<String, String>, serde_json::Error> {
    serde_json::from_str(&self.value)
  }

  /// Decode the payload of a set record.
  pub fn decode_set(&self) -> Result<Vec<String>, serde_json::Error> {
    serde_json::from_str(&self.value)
  }

  /// Decode the payload of a sorted-set record.
  pub fn decode_zset(&self) -> Result<Vec<ZsetMember>, serde_json::Error> {
    serde_json::from_str(&self.value)
  }
}

impl std::fmt::Display for RedisValue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let kind = match self.kind {
      Some(kind) => kind.to_string(),
      None => String::new(),
    };
    write!(
      f,
      "[RedisValue:type={},value={},synced_ts={},expire_ts={}]",
      kind, self.value, self.synced_ts, self.expire_ts
    )
  }
}

/// Encode list/set elements into the persisted payload form.
pub fn encode_elements(elements: &[String]) -> Result<String, serde_json::Error> {
  serde_json::to_string(elements)
}

/// Encode hash fields into the persisted payload form.
pub fn encode_hash(fields: &HashMap<String, String>) -> Result<String, serde_json::Error> {
  serde_json::to_string(fields)
}

/// Encode sorted-set members into the persisted payload form.
pub fn encode_zset(members: &[ZsetMember]) -> Result<String, serde_json::Error> {
  serde_json::to_string(members)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ttl_without_expiry() {
    let value = RedisValue::new(ValueKind::String, "alice".to_string(), 0, 0);
    assert_eq!(value.ttl(1_700_000_000_000), -1);
    assert!(!value.is_expired(1_700_000_000_000));
  }

  #[test]
  fn test_ttl_already_expired() {
    let now = 1_700_000_000_000;
    let value = RedisValue::new(ValueKind::String, "alice".to_string(), 0, now - 1);
    assert_eq!(value.ttl(now), 0);
    assert!(value.is_expired(now));
  }

  #[test]
  fn test_ttl_remaining() {
    let now = 1_700_000_000_000;
    let value = RedisValue::new(ValueKind::String, "alice".to_string(), 0, now + 60_000);
    assert_eq!(value.ttl(now), 60_000);
    assert!(!value.is_expired(now));
  }

  #[test]
  fn test_expiry_at_exact_now_counts_as_expired() {
    let now = 1_700_000_000_000;
    let value = RedisValue::new(ValueKind::String, "alice".to_string(), 0, now);
    assert!(value.is_expired(now));
    assert_eq!(value.ttl(now), 0);
  }

  #[test]
  fn test_zero_sentinel() {
    let value = RedisValue::zero();
    assert!(value.is_zero());
    assert!(!RedisValue::new(ValueKind::List, "[]".to_string(), 0, 0).is_zero());
  }

  #[test]
  fn test_kind_parse_format_roundtrip() {
    for kind in [
      ValueKind::String,
      ValueKind::List,
      ValueKind::Hash,
      ValueKind::Set,
      ValueKind::Zset,
    ] {
      assert_eq!(kind.to_string().parse::<ValueKind>().unwrap(), kind);
    }
    assert!("stream".parse::<ValueKind>().is_err());
  }

  #[test]
  fn test_record_serde_shape() {
    let value = RedisValue::new(ValueKind::String, "alice".to_string(), 10, 20);
    let json = serde_json::to_value(&value).unwrap();
    assert_eq!(
      json,
      serde_json::json!({"type": "string", "value": "alice", "synced_ts": 10, "expire_ts": 20})
    );
    let back: RedisValue = serde_json::from_value(json).unwrap();
    assert_eq!(back, value);
  }

  #[test]
  fn test_unknown_kind_decodes_to_zero_sentinel() {
    let raw = serde_json::json!({"type": "stream", "value": "x", "synced_ts": 0, "expire_ts": 0});
    let value: RedisValue = serde_json::from_value(raw).unwrap();
    assert!(value.is_zero());

    let raw = serde_json::json!({"type": "", "value": "", "synced_ts": 0, "expire_ts": 0});
    let value: RedisValue = serde_json::from_value(raw).unwrap();
    assert!(value.is_zero());
  }

  #[test]
  fn test_payload_codecs() {
    let elements = vec!["a".to_string(), "b".to_string()];
    let list = RedisValue::new(ValueKind::List, encode_elements(&elements).unwrap(), 0, 0);
    assert_eq!(list.decode_list().unwrap(), elements);

    let mut fields = HashMap::new();
    fields.insert("name".to_string(), "alice".to_string());
    let hash = RedisValue::new(ValueKind::Hash, encode_hash(&fields).unwrap(), 0, 0);
    assert_eq!(hash.decode_hash().unwrap(), fields);

    let members = vec![ZsetMember {
      member: "m1".to_string(),
      score: 1.5,
    }];
    let zset = RedisValue::new(ValueKind::Zset, encode_zset(&members).unwrap(), 0, 0);
    assert_eq!(zset.decode_zset().unwrap(), members);
  }
}
