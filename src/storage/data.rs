//! Hash-tag documents: the unit of persistence. Every write reads the current
//! version and CAS-updates it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::value::RedisValue;
use super::{retry_on_conflict, StorageError};
use crate::shard::DbCluster;

pub const DATA_TABLE_PREFIX: &str = "room_data_v2";

/// One persisted hash-tag document: the mapping of all its keys to value
/// records, soft-delete marker and CAS version.
#[derive(Debug, Clone)]
pub struct RoomData {
  pub hash_tag: String,
  pub value: HashMap<String, RedisValue>,
  pub deleted_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub version: i32,
}

/// Read side of the document store, the seam the load engine hydrates from.
#[async_trait]
pub trait DataStore: Send + Sync {
  /// Load the live document for a hash tag. A missing or soft-deleted row is
  /// `Ok(None)`, not an error. Honors the caller's cancellation token.
  async fn load_document(
    &self,
    ctx: &CancellationToken,
    hash_tag: &str,
  ) -> Result<Option<RoomData>, StorageError>;
}

/// Document storage over the sharded Postgres cluster.
pub struct PgDataStore {
  cluster: Arc<DbCluster>,
}

impl PgDataStore {
  pub fn new(cluster: Arc<DbCluster>) -> Self {
    Self { cluster }
  }

  pub fn cluster(&self) -> &DbCluster {
    &self.cluster
  }

  async fn load_inner(&self, hash_tag: &str) -> Result<Option<RoomData>, StorageError> {
    let (table, pool) = self.cluster.resolve(hash_tag, DATA_TABLE_PREFIX)?;
    let client = pool.get().await?;
    let stmt = format!(
      "SELECT hash_tag, value, deleted_at, created_at, updated_at, version \
       FROM {} WHERE hash_tag = $1 AND deleted_at IS NULL",
      table
    );
    let row = client.query_opt(&stmt, &[&hash_tag]).await?;
    match row {
      None => Ok(None),
      Some(row) => {
        let value: serde_json::Value = row.get("value");
        Ok(Some(RoomData {
          hash_tag: row.get("hash_tag"),
          value: serde_json::from_value(value)?,
          deleted_at: row.get("deleted_at"),
          created_at: row.get("created_at"),
          updated_at: row.get("updated_at"),
          version: row.get("version"),
        }))
      }
    }
  }

  /// Upsert a single key inside the document. Inserts the document at
  /// version 0 when absent; otherwise patches the key via `jsonb_set` and
  /// bumps the version under a CAS guard, retrying up to `try_times`.
  pub async fn upsert_value(
    &self,
    hash_tag: &str,
    key: &str,
    value: &RedisValue,
    try_times: usize,
  ) -> Result<(), StorageError> {
    if value.is_zero() {
      return Ok(());
    }
    retry_on_conflict(try_times, || self.upsert_value_once(hash_tag, key, value)).await
  }

  async fn upsert_value_once(
    &self,
    hash_tag: &str,
    key: &str,
    value: &RedisValue,
  ) -> Result<(), StorageError> {
    let (table, pool) = self.cluster.resolve(hash_tag, DATA_TABLE_PREFIX)?;
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let now = Utc::now();
    let select = format!("SELECT version FROM {} WHERE hash_tag = $1", table);
    let row = tx.query_opt(&select, &[&hash_tag]).await?;
    match row {
      None => {
        let mut doc = HashMap::new();
        doc.insert(key.to_string(), value.clone());
        let doc_json = serde_json::to_value(&doc)?;
        let insert = format!(
          "INSERT INTO {} (hash_tag, value, created_at, updated_at, version) \
           VALUES ($1, $2, $3, $3, 0)",
          table
        );
        tx.execute(&insert, &[&hash_tag, &doc_json, &now]).await?;
      }
      Some(row) => {
        let version: i32 = row.get(0);
        let path = vec![key.to_string()];
        let value_json = serde_json::to_value(value)?;
        let update = format!(
          "UPDATE {} SET value = jsonb_set(value, $2, $3), updated_at = $4, version = $5 \
           WHERE hash_tag = $1 AND version = $6",
          table
        );
        let affected = tx
          .execute(
            &update,
            &[&hash_tag, &path, &value_json, &now, &(version + 1), &version],
          )
          .await?;
        if affected == 0 {
          return Err(StorageError::NoRowsUpdated);
        }
      }
    }
    tx.commit().await?;
    Ok(())
  }

  /// Replace the whole value mapping of a document (the sync path), with the
  /// same insert-or-CAS-update envelope as the single-key upsert.
  pub async fn upsert_full_value(
    &self,
    hash_tag: &str,
    value: &HashMap<String, RedisValue>,
    try_times: usize,
  ) -> Result<(), StorageError> {
    retry_on_conflict(try_times, || self.upsert_full_value_once(hash_tag, value)).await
  }

  async fn upsert_full_value_once(
    &self,
    hash_tag: &str,
    value: &HashMap<String, RedisValue>,
  ) -> Result<(), StorageError> {
    let (table, pool) = self.cluster.resolve(hash_tag, DATA_TABLE_PREFIX)?;
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let now = Utc::now();
    let value_json = serde_json::to_value(value)?;
    let select = format!("SELECT version FROM {} WHERE hash_tag = $1", table);
    let row = tx.query_opt(&select, &[&hash_tag]).await?;
    match row {
      None => {
        let insert = format!(
          "INSERT INTO {} (hash_tag, value, created_at, updated_at, version) \
           VALUES ($1, $2, $3, $3, 0)",
          table
        );
        tx.execute(&insert, &[&hash_tag, &value_json, &now]).await?;
      }
      Some(row) => {
        let version: i32 = row.get(0);
        let update = format!(
          "UPDATE {} SET value = $2, updated_at = $3, version = $4 \
           WHERE hash_tag = $1 AND version = $5",
          table
        );
        let affected = tx
          .execute(&update, &[&hash_tag, &value_json, &now, &(version + 1), &version])
          .await?;
        if affected == 0 {
          return Err(StorageError::NoRowsUpdated);
        }
      }
    }
    tx.commit().await?;
    Ok(())
  }

  /// Remove a single key from the document server-side. No CAS on delete;
  /// the version still advances.
  pub async fn delete_value(&self, hash_tag: &str, key: &str) -> Result<(), StorageError> {
    let (table, pool) = self.cluster.resolve(hash_tag, DATA_TABLE_PREFIX)?;
    let client = pool.get().await?;
    let now = Utc::now();
    let update = format!(
      "UPDATE {} SET value = value - $2::text, updated_at = $3, version = version + 1 \
       WHERE hash_tag = $1",
      table
    );
    client.execute(&update, &[&hash_tag, &key, &now]).await?;
    Ok(())
  }
}

#[async_trait]
impl DataStore for PgDataStore {
  async fn load_document(
    &self,
    ctx: &CancellationToken,
    hash_tag: &str,
  ) -> Result<Option<RoomData>, StorageError> {
    tokio::select! {
      _ = ctx.cancelled() => Err(StorageError::Canceled),
      result = self.load_inner(hash_tag) => result,
    }
  }
}
