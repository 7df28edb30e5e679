//! Access and write recency records. Bulk upserts are idempotent and
//! monotonic on their timestamp: a stale timestamp never overwrites a newer
//! one.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio_postgres::types::ToSql;

use super::StorageError;
use crate::shard::DbCluster;

pub const ACCESSED_TABLE_PREFIX: &str = "room_accessed_record_v2";
pub const WRITTEN_TABLE_PREFIX: &str = "room_written_record";

/// Recency of access for one hash tag, consumed by eviction sweeps.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessedRecord {
  pub hash_tag: String,
  pub accessed_at: DateTime<Utc>,
  pub created_at: DateTime<Utc>,
}

/// Recency of write for one full key, consumed by durability sweeps.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenRecord {
  pub key: String,
  pub written_at: DateTime<Utc>,
  pub created_at: DateTime<Utc>,
}

fn accessed_upsert_sql(table: &str, rows: usize) -> String {
  let mut placeholders = Vec::with_capacity(rows);
  for i in 0..rows {
    let base = i * 3;
    placeholders.push(format!("(${}, ${}, ${})", base + 1, base + 2, base + 3));
  }
  format!(
    "INSERT INTO {table} (hash_tag, accessed_at, created_at) VALUES {} \
     ON CONFLICT (hash_tag) DO UPDATE SET accessed_at = EXCLUDED.accessed_at \
     WHERE {table}.accessed_at < EXCLUDED.accessed_at",
    placeholders.join(", ")
  )
}

fn written_upsert_sql(table: &str, rows: usize) -> String {
  let mut placeholders = Vec::with_capacity(rows);
  for i in 0..rows {
    let base = i * 3;
    placeholders.push(format!("(${}, ${}, ${})", base + 1, base + 2, base + 3));
  }
  format!(
    "INSERT INTO {table} (key, written_at, created_at) VALUES {} \
     ON CONFLICT (key) DO UPDATE SET written_at = EXCLUDED.written_at \
     WHERE {table}.written_at < EXCLUDED.written_at",
    placeholders.join(", ")
  )
}

/// Upsert a batch of accessed records, grouped per shard. Conflicting rows
/// only move their `accessed_at` forward.
pub async fn bulk_upsert_accessed_records(
  cluster: &DbCluster,
  records: &[AccessedRecord],
) -> Result<(), StorageError> {
  let mut groups: BTreeMap<usize, Vec<&AccessedRecord>> = BTreeMap::new();
  for record in records {
    groups
      .entry(cluster.shard_index(&record.hash_tag))
      .or_default()
      .push(record);
  }
  for (index, group) in groups {
    let (table, pool) = cluster.resolve_by_index(ACCESSED_TABLE_PREFIX, index)?;
    let stmt = accessed_upsert_sql(&table, group.len());
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(group.len() * 3);
    for record in &group {
      params.push(&record.hash_tag);
      params.push(&record.accessed_at);
      params.push(&record.created_at);
    }
    pool.get().await?.execute(&stmt, &params).await?;
  }
  Ok(())
}

/// Upsert a batch of written records, grouped per shard. Conflicting rows
/// only move their `written_at` forward.
pub async fn bulk_upsert_written_records(
  cluster: &DbCluster,
  records: &[WrittenRecord],
) -> Result<(), StorageError> {
  let mut groups: BTreeMap<usize, Vec<&WrittenRecord>> = BTreeMap::new();
  for record in records {
    groups
      .entry(cluster.shard_index(&record.key))
      .or_default()
      .push(record);
  }
  for (index, group) in groups {
    let (table, pool) = cluster.resolve_by_index(WRITTEN_TABLE_PREFIX, index)?;
    let stmt = written_upsert_sql(&table, group.len());
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(group.len() * 3);
    for record in &group {
      params.push(&record.key);
      params.push(&record.written_at);
      params.push(&record.created_at);
    }
    pool.get().await?.execute(&stmt, &params).await?;
  }
  Ok(())
}

/// Point load of an accessed record.
pub async fn load_accessed_record(
  cluster: &DbCluster,
  hash_tag: &str,
) -> Result<Option<AccessedRecord>, StorageError> {
  let (table, pool) = cluster.resolve(hash_tag, ACCESSED_TABLE_PREFIX)?;
  let stmt = format!(
    "SELECT hash_tag, accessed_at, created_at FROM {} WHERE hash_tag = $1",
    table
  );
  let row = pool.get().await?.query_opt(&stmt, &[&hash_tag]).await?;
  Ok(row.map(|row| AccessedRecord {
    hash_tag: row.get(0),
    accessed_at: row.get(1),
    created_at: row.get(2),
  }))
}

/// Point load of a written record.
pub async fn load_written_record(
  cluster: &DbCluster,
  key: &str,
) -> Result<Option<WrittenRecord>, StorageError> {
  let (table, pool) = cluster.resolve(key, WRITTEN_TABLE_PREFIX)?;
  let stmt = format!(
    "SELECT key, written_at, created_at FROM {} WHERE key = $1",
    table
  );
  let row = pool.get().await?.query_opt(&stmt, &[&key]).await?;
  Ok(row.map(|row| WrittenRecord {
    key: row.get(0),
    written_at: row.get(1),
    created_at: row.get(2),
  }))
}

/// Scan shards in index order for accessed records older than `threshold`,
/// skipping `excluded_hash_tags`. Returns the first shard's candidates,
/// capped at `count`.
pub async fn scan_accessed_records(
  cluster: &DbCluster,
  count: usize,
  threshold: DateTime<Utc>,
  excluded_hash_tags: &[String],
) -> Result<Vec<AccessedRecord>, StorageError> {
  let mut excluded_by_shard: BTreeMap<usize, Vec<String>> = BTreeMap::new();
  for hash_tag in excluded_hash_tags {
    excluded_by_shard
      .entry(cluster.shard_index(hash_tag))
      .or_default()
      .push(hash_tag.clone());
  }

  for index in 0..cluster.sharding_count() {
    let (table, pool) = cluster.resolve_by_index(ACCESSED_TABLE_PREFIX, index)?;
    let excluded = excluded_by_shard.get(&index);
    let stmt = match excluded {
      Some(_) => format!(
        "SELECT hash_tag, accessed_at, created_at FROM {} \
         WHERE accessed_at < $1 AND hash_tag <> ALL($2) LIMIT {}",
        table, count
      ),
      None => format!(
        "SELECT hash_tag, accessed_at, created_at FROM {} \
         WHERE accessed_at < $1 LIMIT {}",
        table, count
      ),
    };
    let client = pool.get().await?;
    let rows = match excluded {
      Some(excluded) => client.query(&stmt, &[&threshold, excluded]).await?,
      None => client.query(&stmt, &[&threshold]).await?,
    };
    if !rows.is_empty() {
      return Ok(
        rows
          .iter()
          .map(|row| AccessedRecord {
            hash_tag: row.get(0),
            accessed_at: row.get(1),
            created_at: row.get(2),
          })
          .collect(),
      );
    }
  }
  Ok(Vec::new())
}

/// Scan shards in index order for written records, capped at `count`.
pub async fn scan_written_records(
  cluster: &DbCluster,
  count: usize,
) -> Result<Vec<WrittenRecord>, StorageError> {
  for index in 0..cluster.sharding_count() {
    let (table, pool) = cluster.resolve_by_index(WRITTEN_TABLE_PREFIX, index)?;
    let stmt = format!(
      "SELECT key, written_at, created_at FROM {} LIMIT {}",
      table, count
    );
    let rows = pool.get().await?.query(&stmt, &[]).await?;
    if !rows.is_empty() {
      return Ok(
        rows
          .iter()
          .map(|row| WrittenRecord {
            key: row.get(0),
            written_at: row.get(1),
            created_at: row.get(2),
          })
          .collect(),
      );
    }
  }
  Ok(Vec::new())
}

/// Delete a written record only if its timestamp still matches; a record
/// rewritten since the sweep read it stays put.
pub async fn delete_written_record(
  cluster: &DbCluster,
  key: &str,
  written_at: DateTime<Utc>,
) -> Result<(), StorageError> {
  let (table, pool) = cluster.resolve(key, WRITTEN_TABLE_PREFIX)?;
  let stmt = format!("DELETE FROM {} WHERE key = $1 AND written_at = $2", table);
  pool.get().await?.execute(&stmt, &[&key, &written_at]).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_accessed_upsert_sql_is_monotonic() {
    let sql = accessed_upsert_sql("room_accessed_record_v2_3", 2);
    assert!(sql.starts_with(
      "INSERT INTO room_accessed_record_v2_3 (hash_tag, accessed_at, created_at) \
       VALUES ($1, $2, $3), ($4, $5, $6)"
    ));
    assert!(sql.contains("ON CONFLICT (hash_tag) DO UPDATE"));
    assert!(sql.contains("room_accessed_record_v2_3.accessed_at < EXCLUDED.accessed_at"));
  }

  #[test]
  fn test_written_upsert_sql_is_monotonic() {
    let sql = written_upsert_sql("room_written_record_0", 1);
    assert!(sql.contains("ON CONFLICT (key) DO UPDATE SET written_at = EXCLUDED.written_at"));
    assert!(sql.contains("room_written_record_0.written_at < EXCLUDED.written_at"));
  }
}
