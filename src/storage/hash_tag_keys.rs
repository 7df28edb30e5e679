//! Per-hash-tag key index: the set of known keys, their recency and the sync
//! lifecycle status, updated from reported access events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::types::ToSql;

use super::StorageError;
use crate::events::{AccessMode, HashTagEvent};
use crate::shard::DbCluster;

pub const HASH_TAG_KEYS_TABLE_PREFIX: &str = "room_hash_tag_keys";

/// Sync lifecycle of a hash tag's key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeysStatus {
  NeedSynced,
  Synced,
  Cleaned,
}

impl std::fmt::Display for KeysStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      KeysStatus::NeedSynced => write!(f, "need_synced"),
      KeysStatus::Synced => write!(f, "synced"),
      KeysStatus::Cleaned => write!(f, "cleaned"),
    }
  }
}

impl std::str::FromStr for KeysStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "need_synced" => Ok(KeysStatus::NeedSynced),
      "synced" => Ok(KeysStatus::Synced),
      "cleaned" => Ok(KeysStatus::Cleaned),
      _ => Err(format!("unknown keys status: {}", s)),
    }
  }
}

#[derive(Debug, Clone)]
pub struct HashTagKeys {
  pub hash_tag: String,
  pub keys: Vec<String>,
  pub accessed_at: DateTime<Utc>,
  pub written_at: Option<DateTime<Utc>>,
  pub synced_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub status: KeysStatus,
  pub version: i64,
}

impl HashTagKeys {
  /// Fold an access event into the model, returning the columns that
  /// actually changed. New keys or a write push the status back to
  /// NeedSynced; a read on a Cleaned tag revives it to Synced.
  pub fn update_from_event(&mut self, event: &HashTagEvent) -> Vec<&'static str> {
    let mut changed = Vec::new();

    let origin_len = self.keys.len();
    for key in event.keys() {
      if !self.keys.contains(key) {
        self.keys.push(key.clone());
      }
    }
    let keys_changed = self.keys.len() != origin_len;
    if keys_changed {
      changed.push("keys");
    }

    if event.access_time() > self.accessed_at {
      self.accessed_at = event.access_time();
      changed.push("accessed_at");
    }
    if event.access_mode() == AccessMode::Write
      && self.written_at.map(|t| event.access_time() > t).unwrap_or(true)
    {
      self.written_at = Some(event.access_time());
      changed.push("written_at");
    }

    let new_status = if keys_changed || event.access_mode() == AccessMode::Write {
      Some(KeysStatus::NeedSynced)
    } else if self.status == KeysStatus::Cleaned {
      Some(KeysStatus::Synced)
    } else {
      None
    };
    if let Some(status) = new_status {
      if status != self.status {
        self.status = status;
        changed.push("status");
      }
    }
    changed
  }
}

fn row_to_model(row: &tokio_postgres::Row) -> Result<HashTagKeys, StorageError> {
  let status: String = row.get("status");
  Ok(HashTagKeys {
    hash_tag: row.get("hash_tag"),
    keys: row.get("keys"),
    accessed_at: row.get("accessed_at"),
    written_at: row.get("written_at"),
    synced_at: row.get("synced_at"),
    created_at: row.get("created_at"),
    updated_at: row.get("updated_at"),
    status: status.parse().map_err(StorageError::Decode)?,
    version: row.get("version"),
  })
}

/// Insert or CAS-update the key index for the event's hash tag.
pub async fn upsert_by_event(
  cluster: &DbCluster,
  event: &HashTagEvent,
  now: DateTime<Utc>,
) -> Result<(), StorageError> {
  let (table, pool) = cluster.resolve(event.hash_tag(), HASH_TAG_KEYS_TABLE_PREFIX)?;
  let mut client = pool.get().await?;
  let tx = client.transaction().await?;

  let select = format!(
    "SELECT hash_tag, keys, accessed_at, written_at, synced_at, created_at, updated_at, \
     status, version FROM {} WHERE hash_tag = $1",
    table
  );
  let hash_tag = event.hash_tag().to_string();
  let row = tx.query_opt(&select, &[&hash_tag]).await?;

  match row {
    None => {
      let keys: Vec<String> = event.keys().iter().cloned().collect();
      let written_at = match event.access_mode() {
        AccessMode::Write => Some(event.access_time()),
        AccessMode::Read => None,
      };
      let status = if keys.is_empty() && written_at.is_none() {
        KeysStatus::Synced
      } else {
        KeysStatus::NeedSynced
      };
      let status_str = status.to_string();
      let insert = format!(
        "INSERT INTO {} (hash_tag, keys, accessed_at, written_at, created_at, updated_at, \
         status, version) VALUES ($1, $2, $3, $4, $5, $5, $6, 0)",
        table
      );
      let access_time = event.access_time();
      tx.execute(
        &insert,
        &[&hash_tag, &keys, &access_time, &written_at, &now, &status_str],
      )
      .await?;
    }
    Some(row) => {
      let mut model = row_to_model(&row)?;
      let origin_version = model.version;
      let changed = model.update_from_event(event);
      if changed.is_empty() {
        return Ok(());
      }
      model.version += 1;
      model.updated_at = now;

      let status_str = model.status.to_string();
      let mut assignments = Vec::with_capacity(changed.len() + 2);
      let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(changed.len() + 4);
      for column in &changed {
        params.push(match *column {
          "keys" => &model.keys,
          "accessed_at" => &model.accessed_at,
          "written_at" => &model.written_at,
          "status" => &status_str,
          _ => unreachable!("unexpected column {}", column),
        });
        assignments.push(format!("{} = ${}", column, params.len()));
      }
      params.push(&model.version);
      assignments.push(format!("version = ${}", params.len()));
      params.push(&model.updated_at);
      assignments.push(format!("updated_at = ${}", params.len()));

      params.push(&model.hash_tag);
      let pk_idx = params.len();
      params.push(&origin_version);
      let version_idx = params.len();
      let update = format!(
        "UPDATE {} SET {} WHERE hash_tag = ${} AND version = ${}",
        table,
        assignments.join(", "),
        pk_idx,
        version_idx
      );
      let affected = tx.execute(&update, &params).await?;
      if affected != 1 {
        return Err(StorageError::NoRowsUpdated);
      }
    }
  }
  tx.commit().await?;
  Ok(())
}

async fn set_status(
  cluster: &DbCluster,
  model: &HashTagKeys,
  status: KeysStatus,
  synced_at: Option<DateTime<Utc>>,
  t: DateTime<Utc>,
) -> Result<(), StorageError> {
  let (table, pool) = cluster.resolve(&model.hash_tag, HASH_TAG_KEYS_TABLE_PREFIX)?;
  let status_str = status.to_string();
  let next_version = model.version + 1;
  let client = pool.get().await?;
  let affected = match synced_at {
    Some(synced_at) => {
      let stmt = format!(
        "UPDATE {} SET status = $1, synced_at = $2, updated_at = $3, version = $4 \
         WHERE hash_tag = $5 AND version = $6",
        table
      );
      client
        .execute(
          &stmt,
          &[&status_str, &synced_at, &t, &next_version, &model.hash_tag, &model.version],
        )
        .await?
    }
    None => {
      let stmt = format!(
        "UPDATE {} SET status = $1, updated_at = $2, version = $3 \
         WHERE hash_tag = $4 AND version = $5",
        table
      );
      client
        .execute(
          &stmt,
          &[&status_str, &t, &next_version, &model.hash_tag, &model.version],
        )
        .await?
    }
  };
  if affected != 1 {
    return Err(StorageError::NoRowsUpdated);
  }
  Ok(())
}

/// Mark a key index as synced, stamping `synced_at`, under a version guard.
pub async fn set_status_synced(
  cluster: &DbCluster,
  model: &HashTagKeys,
  t: DateTime<Utc>,
) -> Result<(), StorageError> {
  set_status(cluster, model, KeysStatus::Synced, Some(t), t).await
}

/// Mark a key index as cleaned under a version guard.
pub async fn set_status_cleaned(
  cluster: &DbCluster,
  model: &HashTagKeys,
  t: DateTime<Utc>,
) -> Result<(), StorageError> {
  set_status(cluster, model, KeysStatus::Cleaned, None, t).await
}

/// Typed scan predicates over the key index.
#[derive(Debug, Clone)]
pub enum ScanCondition {
  StatusEquals(KeysStatus),
  AccessedBefore(DateTime<Utc>),
  WrittenBefore(DateTime<Utc>),
  SyncedBefore(DateTime<Utc>),
}

impl ScanCondition {
  fn clause(&self, placeholder: usize) -> String {
    match self {
      ScanCondition::StatusEquals(_) => format!("status = ${}", placeholder),
      ScanCondition::AccessedBefore(_) => format!("accessed_at < ${}", placeholder),
      ScanCondition::WrittenBefore(_) => format!("written_at < ${}", placeholder),
      ScanCondition::SyncedBefore(_) => format!("synced_at < ${}", placeholder),
    }
  }
}

/// Scan shards in index order for key-index rows matching every condition,
/// returning the first shard's matches capped at `count`.
pub async fn scan_by_conditions(
  cluster: &DbCluster,
  count: usize,
  conditions: &[ScanCondition],
) -> Result<Vec<HashTagKeys>, StorageError> {
  let status_params: Vec<String> = conditions
    .iter()
    .map(|c| match c {
      ScanCondition::StatusEquals(status) => status.to_string(),
      _ => String::new(),
    })
    .collect();

  for index in 0..cluster.sharding_count() {
    let (table, pool) = cluster.resolve_by_index(HASH_TAG_KEYS_TABLE_PREFIX, index)?;
    let mut clauses = Vec::with_capacity(conditions.len());
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(conditions.len());
    for (i, condition) in conditions.iter().enumerate() {
      params.push(match condition {
        ScanCondition::StatusEquals(_) => &status_params[i],
        ScanCondition::AccessedBefore(t)
        | ScanCondition::WrittenBefore(t)
        | ScanCondition::SyncedBefore(t) => t,
      });
      clauses.push(condition.clause(params.len()));
    }
    let where_sql = if clauses.is_empty() {
      String::new()
    } else {
      format!(" WHERE {}", clauses.join(" AND "))
    };
    let stmt = format!(
      "SELECT hash_tag, keys, accessed_at, written_at, synced_at, created_at, updated_at, \
       status, version FROM {}{} LIMIT {}",
      table, where_sql, count
    );
    let rows = pool.get().await?.query(&stmt, &params).await?;
    if !rows.is_empty() {
      return rows.iter().map(row_to_model).collect();
    }
  }
  Ok(Vec::new())
}
