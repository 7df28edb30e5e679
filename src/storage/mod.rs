//! Sharded storage layer: versioned hash-tag documents plus access and write
//! recency records, all resolved through the shard mapper.

pub mod data;
pub mod hash_tag_keys;
pub mod records;
pub mod value;

pub use data::{DataStore, PgDataStore, RoomData};
pub use hash_tag_keys::{HashTagKeys, KeysStatus};
pub use records::{AccessedRecord, WrittenRecord};
pub use value::{RedisValue, ValueKind, ZsetMember};

use crate::shard::ShardError;

/// How many times optimistic-concurrency writes are retried in place.
pub const DEFAULT_UPSERT_TRY_TIMES: usize = 3;

#[derive(Debug)]
pub enum StorageError {
  /// CAS miss: the guarded update matched zero rows.
  NoRowsUpdated,
  Shard(ShardError),
  Pool(String),
  Db(tokio_postgres::Error),
  Json(serde_json::Error),
  Decode(String),
  Canceled,
}

impl StorageError {
  /// Errors retried in place: CAS misses, integrity violations and writes
  /// that lost their connection mid-transaction. Everything else surfaces
  /// immediately.
  pub fn is_retryable(&self) -> bool {
    match self {
      StorageError::NoRowsUpdated => true,
      StorageError::Db(e) => {
        if e.is_closed() {
          return true;
        }
        e.code()
          .map(|code| code.code().starts_with("23"))
          .unwrap_or(false)
      }
      _ => false,
    }
  }
}

impl std::fmt::Display for StorageError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      StorageError::NoRowsUpdated => write!(f, "no rows updated"),
      StorageError::Shard(e) => write!(f, "{}", e),
      StorageError::Pool(msg) => write!(f, "pool error: {}", msg),
      StorageError::Db(e) => write!(f, "db error: {}", e),
      StorageError::Json(e) => write!(f, "json error: {}", e),
      StorageError::Decode(msg) => write!(f, "decode error: {}", msg),
      StorageError::Canceled => write!(f, "storage operation canceled"),
    }
  }
}

impl std::error::Error for StorageError {}

impl From<ShardError> for StorageError {
  fn from(e: ShardError) -> Self {
    StorageError::Shard(e)
  }
}

impl From<tokio_postgres::Error> for StorageError {
  fn from(e: tokio_postgres::Error) -> Self {
    StorageError::Db(e)
  }
}

impl From<deadpool_postgres::PoolError> for StorageError {
  fn from(e: deadpool_postgres::PoolError) -> Self {
    StorageError::Pool(e.to_string())
  }
}

impl From<serde_json::Error> for StorageError {
  fn from(e: serde_json::Error) -> Self {
    StorageError::Json(e)
  }
}

/// Run `op` up to `try_times` times, retrying only on retryable errors.
pub(crate) async fn retry_on_conflict<T, F, Fut>(
  try_times: usize,
  mut op: F,
) -> Result<T, StorageError>
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = Result<T, StorageError>>,
{
  let tries = try_times.max(1);
  let mut last_err = None;
  for _ in 0..tries {
    match op().await {
      Ok(value) => return Ok(value),
      Err(e) if e.is_retryable() => {
        last_err = Some(e);
      }
      Err(e) => return Err(e),
    }
  }
  Err(last_err.unwrap_or(StorageError::NoRowsUpdated))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn test_retry_classification() {
    assert!(StorageError::NoRowsUpdated.is_retryable());
    assert!(!StorageError::Canceled.is_retryable());
    assert!(!StorageError::Pool("timed out".to_string()).is_retryable());
  }

  #[tokio::test]
  async fn test_retry_on_conflict_bounded() {
    let attempts = AtomicUsize::new(0);
    let result: Result<(), _> = retry_on_conflict(3, || {
      attempts.fetch_add(1, Ordering::SeqCst);
      async { Err(StorageError::NoRowsUpdated) }
    })
    .await;
    assert!(matches!(result, Err(StorageError::NoRowsUpdated)));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_retry_stops_on_permanent_error() {
    let attempts = AtomicUsize::new(0);
    let result: Result<(), _> = retry_on_conflict(3, || {
      attempts.fetch_add(1, Ordering::SeqCst);
      async { Err(StorageError::Canceled) }
    })
    .await;
    assert!(matches!(result, Err(StorageError::Canceled)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_retry_succeeds_after_conflicts() {
    let attempts = AtomicUsize::new(0);
    let result = retry_on_conflict(3, || {
      let n = attempts.fetch_add(1, Ordering::SeqCst);
      async move {
        if n < 2 {
          Err(StorageError::NoRowsUpdated)
        } else {
          Ok(n)
        }
      }
    })
    .await;
    assert_eq!(result.unwrap(), 2);
  }
}
