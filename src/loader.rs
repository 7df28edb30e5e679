//! Load engine: materializes every key of a hash tag from durable storage
//! into the cache before the first command on it is served. At most one load
//! per hash tag is in flight process-wide; concurrent callers collapse onto
//! the same outcome.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::UpstreamCache;
use crate::events::AccessMode;
use crate::storage::value::ValueKind;
use crate::storage::DataStore;

const LOAD_TRY_TIMES: usize = 3;

type FlightResult = Option<Result<(), LoadError>>;

#[derive(Debug, Clone)]
pub enum LoadError {
  Storage(String),
  Cache(String),
  Payload { key: String, detail: String },
}

impl std::fmt::Display for LoadError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      LoadError::Storage(msg) => write!(f, "storage error: {}", msg),
      LoadError::Cache(msg) => write!(f, "cache error: {}", msg),
      LoadError::Payload { key, detail } => {
        write!(f, "invalid payload for key {}: {}", key, detail)
      }
    }
  }
}

impl std::error::Error for LoadError {}

pub struct Loader {
  store: Arc<dyn DataStore>,
  cache: Arc<dyn UpstreamCache>,
  loaded: DashSet<String>,
  flights: DashMap<String, watch::Receiver<FlightResult>>,
}

impl Loader {
  pub fn new(store: Arc<dyn DataStore>, cache: Arc<dyn UpstreamCache>) -> Self {
    Self {
      store,
      cache,
      loaded: DashSet::new(),
      flights: DashMap::new(),
    }
  }

  /// Ensure the hash tag's durable state is materialized in the cache.
  /// Idempotent: a loaded tag is a no-op. Concurrent callers for the same
  /// tag wait on the in-flight load and observe its outcome.
  pub async fn load(
    &self,
    ctx: &CancellationToken,
    hash_tag: &str,
    access_time: DateTime<Utc>,
    access_mode: AccessMode,
  ) -> Result<(), LoadError> {
    if hash_tag.is_empty() {
      return Ok(());
    }
    loop {
      if self.loaded.contains(hash_tag) {
        return Ok(());
      }

      let (leader_tx, waiter_rx) = {
        let (tx, rx) = watch::channel::<FlightResult>(None);
        match self.flights.entry(hash_tag.to_string()) {
          dashmap::mapref::entry::Entry::Occupied(entry) => (None, Some(entry.get().clone())),
          dashmap::mapref::entry::Entry::Vacant(entry) => {
            entry.insert(rx);
            (Some(tx), None)
          }
        }
      };

      if let Some(tx) = leader_tx {
        tracing::debug!(
          hash_tag,
          access_mode = %access_mode,
          access_time = %access_time.to_rfc3339(),
          "loading hash tag"
        );
        let result = self.do_load(ctx, hash_tag).await;
        if result.is_ok() {
          self.loaded.insert(hash_tag.to_string());
        }
        let _ = tx.send(Some(result.clone()));
        self.flights.remove(hash_tag);
        return result;
      }

      let Some(mut rx) = waiter_rx else {
        continue;
      };
      loop {
        {
          let value = rx.borrow_and_update();
          if let Some(result) = value.as_ref() {
            return result.clone();
          }
        }
        if rx.changed().await.is_err() {
          // The flight died without publishing a result; start over.
          break;
        }
      }
    }
  }

  async fn do_load(&self, ctx: &CancellationToken, hash_tag: &str) -> Result<(), LoadError> {
    let mut document = None;
    let mut last_err = None;
    for _ in 0..LOAD_TRY_TIMES {
      match self.store.load_document(ctx, hash_tag).await {
        Ok(loaded) => {
          document = loaded;
          last_err = None;
          break;
        }
        Err(e) if e.is_retryable() => last_err = Some(e),
        Err(e) => return Err(LoadError::Storage(e.to_string())),
      }
    }
    if let Some(e) = last_err {
      return Err(LoadError::Storage(e.to_string()));
    }

    // Absent or soft-deleted documents load as the empty set.
    let Some(document) = document else {
      return Ok(());
    };

    for (key, record) in &document.value {
      let Some(kind) = record.kind else {
        continue;
      };
      match kind {
        ValueKind::String => {
          self
            .cache
            .set(key, &record.value)
            .await
            .map_err(|e| LoadError::Cache(e.to_string()))?;
        }
        ValueKind::List => {
          let elements = record.decode_list().map_err(|e| LoadError::Payload {
            key: key.clone(),
            detail: e.to_string(),
          })?;
          if !elements.is_empty() {
            self
              .cache
              .rpush(key, &elements)
              .await
              .map_err(|e| LoadError::Cache(e.to_string()))?;
          }
        }
        ValueKind::Hash => {
          let fields = record.decode_hash().map_err(|e| LoadError::Payload {
            key: key.clone(),
            detail: e.to_string(),
          })?;
          if !fields.is_empty() {
            self
              .cache
              .hset(key, &fields)
              .await
              .map_err(|e| LoadError::Cache(e.to_string()))?;
          }
        }
        ValueKind::Set => {
          let members = record.decode_set().map_err(|e| LoadError::Payload {
            key: key.clone(),
            detail: e.to_string(),
          })?;
          if !members.is_empty() {
            self
              .cache
              .sadd(key, &members)
              .await
              .map_err(|e| LoadError::Cache(e.to_string()))?;
          }
        }
        ValueKind::Zset => {
          let members = record.decode_zset().map_err(|e| LoadError::Payload {
            key: key.clone(),
            detail: e.to_string(),
          })?;
          if !members.is_empty() {
            self
              .cache
              .zadd(key, &members)
              .await
              .map_err(|e| LoadError::Cache(e.to_string()))?;
          }
        }
      }
      if record.expire_ts > 0 {
        self
          .cache
          .pexpire_at(key, record.expire_ts)
          .await
          .map_err(|e| LoadError::Cache(e.to_string()))?;
      }
    }
    Ok(())
  }
}
