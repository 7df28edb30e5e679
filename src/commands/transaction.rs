//! Per-connection MULTI/WATCH transaction state.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use super::{execute_command, Command};
use crate::cache::UpstreamCache;
use crate::resp::RespValue;

/// Process-wide write versions per key. Every write-mode command bumps the
/// versions of its write keys; WATCH snapshots them and EXEC compares.
#[derive(Debug, Default)]
pub struct KeyVersions {
  versions: DashMap<String, u64>,
}

impl KeyVersions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &str) -> u64 {
    self.versions.get(key).map(|v| *v).unwrap_or(0)
  }

  pub fn bump(&self, key: &str) {
    *self.versions.entry(key.to_string()).or_insert(0) += 1;
  }

  pub fn bump_all(&self, keys: &[String]) {
    for key in keys {
      self.bump(key);
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
  Idle,
  Watching,
  Queuing,
  Closed,
}

/// One connection's transaction: the queued commands and the WATCHed key
/// versions. Owned exclusively by its connection until closed.
pub struct Transaction {
  state: TxState,
  queued: Vec<Command>,
  watched: HashMap<String, u64>,
}

impl Default for Transaction {
  fn default() -> Self {
    Self::new()
  }
}

impl Transaction {
  pub fn new() -> Self {
    Self {
      state: TxState::Idle,
      queued: Vec::new(),
      watched: HashMap::new(),
    }
  }

  pub fn state(&self) -> TxState {
    self.state
  }

  pub fn is_closed(&self) -> bool {
    self.state == TxState::Closed
  }

  /// Drive the state machine with one command. Non-transaction commands
  /// queue while in MULTI and execute directly otherwise; protocol misuse
  /// closes the transaction.
  pub async fn process(
    &mut self,
    command: Command,
    cache: &dyn UpstreamCache,
    versions: &KeyVersions,
  ) -> RespValue {
    let name = command.name().to_string();
    match (self.state, name.as_str()) {
      (TxState::Closed, _) => {
        RespValue::error("ERR transaction is closed")
      }
      (TxState::Idle | TxState::Watching, "multi") => {
        self.state = TxState::Queuing;
        RespValue::ok()
      }
      (TxState::Queuing, "multi") => {
        self.state = TxState::Closed;
        RespValue::error("ERR MULTI calls can not be nested")
      }
      (TxState::Idle | TxState::Watching, "watch") => {
        for key in command.read_keys() {
          self.watched.insert(key.clone(), versions.get(key));
        }
        self.state = TxState::Watching;
        RespValue::ok()
      }
      (TxState::Queuing, "watch") => {
        self.state = TxState::Closed;
        RespValue::error("ERR WATCH inside MULTI is not allowed")
      }
      (TxState::Idle | TxState::Watching, "unwatch") => {
        self.watched.clear();
        self.state = TxState::Idle;
        RespValue::ok()
      }
      (TxState::Queuing, "exec") => self.exec(cache, versions).await,
      (TxState::Idle | TxState::Watching, "exec") => {
        self.state = TxState::Closed;
        RespValue::error("ERR EXEC without MULTI")
      }
      (TxState::Queuing, "discard") => {
        self.queued.clear();
        self.watched.clear();
        self.state = TxState::Closed;
        RespValue::ok()
      }
      (TxState::Idle | TxState::Watching, "discard") => {
        self.state = TxState::Closed;
        RespValue::error("ERR DISCARD without MULTI")
      }
      (TxState::Queuing, _) => {
        self.queued.push(command);
        RespValue::queued()
      }
      (TxState::Idle | TxState::Watching, _) => {
        let result = execute_command(cache, &command).await;
        if !matches!(result, RespValue::Error(_)) {
          versions.bump_all(command.write_keys());
        }
        result
      }
    }
  }

  /// Run the queue under the WATCH guard: any watched key whose version
  /// moved aborts with a null array and nothing is applied.
  async fn exec(&mut self, cache: &dyn UpstreamCache, versions: &KeyVersions) -> RespValue {
    self.state = TxState::Closed;
    for (key, version) in &self.watched {
      if versions.get(key) != *version {
        self.queued.clear();
        return RespValue::null_array();
      }
    }

    let queued = std::mem::take(&mut self.queued);
    let mut results = Vec::with_capacity(queued.len());
    for command in &queued {
      let result = execute_command(cache, command).await;
      if !matches!(result, RespValue::Error(_)) {
        versions.bump_all(command.write_keys());
      }
      results.push(result);
    }
    RespValue::array(results)
  }
}

/// Connection-to-transaction binding, keyed by connection identity.
#[derive(Default)]
pub struct TransactionManager {
  transactions: DashMap<Uuid, Arc<AsyncMutex<Transaction>>>,
}

impl TransactionManager {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, conn_id: Uuid) -> Option<Arc<AsyncMutex<Transaction>>> {
    self.transactions.get(&conn_id).map(|t| t.clone())
  }

  /// Fetch the connection's transaction, creating one if the command is
  /// WATCH or MULTI.
  pub fn get_or_create(
    &self,
    conn_id: Uuid,
    command_name: &str,
  ) -> Option<Arc<AsyncMutex<Transaction>>> {
    if let Some(transaction) = self.get(conn_id) {
      return Some(transaction);
    }
    if matches!(command_name, "watch" | "multi") {
      let transaction = Arc::new(AsyncMutex::new(Transaction::new()));
      self.transactions.insert(conn_id, transaction.clone());
      return Some(transaction);
    }
    None
  }

  pub fn remove(&self, conn_id: Uuid) -> bool {
    self.transactions.remove(&conn_id).is_some()
  }

  pub fn count(&self) -> usize {
    self.transactions.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheError;
  use crate::commands::parse_command;
  use async_trait::async_trait;
  use parking_lot::Mutex;
  use std::collections::HashMap;

  /// Upstream fake: answers OK to writes and tracks executed commands.
  #[derive(Default)]
  struct FakeCache {
    executed: Mutex<Vec<String>>,
  }

  #[async_trait]
  impl UpstreamCache for FakeCache {
    async fn execute(&self, name: &str, args: &[String]) -> Result<RespValue, CacheError> {
      self
        .executed
        .lock()
        .push(format!("{} {}", name, args.join(" ")));
      Ok(RespValue::ok())
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), CacheError> {
      Ok(())
    }

    async fn rpush(&self, _key: &str, _elements: &[String]) -> Result<(), CacheError> {
      Ok(())
    }

    async fn hset(&self, _key: &str, _fields: &HashMap<String, String>) -> Result<(), CacheError> {
      Ok(())
    }

    async fn sadd(&self, _key: &str, _members: &[String]) -> Result<(), CacheError> {
      Ok(())
    }

    async fn zadd(
      &self,
      _key: &str,
      _members: &[crate::storage::ZsetMember],
    ) -> Result<(), CacheError> {
      Ok(())
    }

    async fn pexpire_at(&self, _key: &str, _at_ms: i64) -> Result<(), CacheError> {
      Ok(())
    }
  }

  fn command(raw: &str) -> Command {
    let parts: Vec<String> = raw.split_whitespace().map(|s| s.to_string()).collect();
    parse_command(&parts).unwrap()
  }

  #[tokio::test]
  async fn test_multi_queues_then_exec_runs_in_order() {
    let cache = FakeCache::default();
    let versions = KeyVersions::new();
    let mut tx = Transaction::new();

    assert_eq!(tx.process(command("MULTI"), &cache, &versions).await, RespValue::ok());
    assert_eq!(tx.state(), TxState::Queuing);
    assert_eq!(
      tx.process(command("SET {t}:a 1"), &cache, &versions).await,
      RespValue::queued()
    );
    assert_eq!(
      tx.process(command("SET {t}:b 2"), &cache, &versions).await,
      RespValue::queued()
    );

    let result = tx.process(command("EXEC"), &cache, &versions).await;
    assert_eq!(
      result,
      RespValue::array(vec![RespValue::ok(), RespValue::ok()])
    );
    assert!(tx.is_closed());
    assert_eq!(
      *cache.executed.lock(),
      vec!["set {t}:a 1".to_string(), "set {t}:b 2".to_string()]
    );
    assert_eq!(versions.get("{t}:a"), 1);
  }

  #[tokio::test]
  async fn test_watch_violation_aborts_exec() {
    let cache = FakeCache::default();
    let versions = KeyVersions::new();
    let mut tx = Transaction::new();

    tx.process(command("WATCH {t}:k"), &cache, &versions).await;
    assert_eq!(tx.state(), TxState::Watching);
    tx.process(command("MULTI"), &cache, &versions).await;
    tx.process(command("SET {t}:k v2"), &cache, &versions).await;

    // Another connection writes the watched key.
    versions.bump("{t}:k");

    let result = tx.process(command("EXEC"), &cache, &versions).await;
    assert_eq!(result, RespValue::null_array());
    assert!(tx.is_closed());
    assert!(cache.executed.lock().is_empty());
  }

  #[tokio::test]
  async fn test_exec_applies_when_watch_unchanged() {
    let cache = FakeCache::default();
    let versions = KeyVersions::new();
    let mut tx = Transaction::new();

    tx.process(command("WATCH {t}:k"), &cache, &versions).await;
    tx.process(command("MULTI"), &cache, &versions).await;
    tx.process(command("SET {t}:k v2"), &cache, &versions).await;

    let result = tx.process(command("EXEC"), &cache, &versions).await;
    assert_eq!(result, RespValue::array(vec![RespValue::ok()]));
    assert_eq!(versions.get("{t}:k"), 1);
  }

  #[tokio::test]
  async fn test_discard_drops_queue() {
    let cache = FakeCache::default();
    let versions = KeyVersions::new();
    let mut tx = Transaction::new();

    tx.process(command("MULTI"), &cache, &versions).await;
    tx.process(command("SET {t}:a 1"), &cache, &versions).await;
    assert_eq!(tx.process(command("DISCARD"), &cache, &versions).await, RespValue::ok());
    assert!(tx.is_closed());
    assert!(cache.executed.lock().is_empty());
  }

  #[tokio::test]
  async fn test_unwatch_returns_to_idle() {
    let cache = FakeCache::default();
    let versions = KeyVersions::new();
    let mut tx = Transaction::new();

    tx.process(command("WATCH {t}:k"), &cache, &versions).await;
    assert_eq!(tx.process(command("UNWATCH"), &cache, &versions).await, RespValue::ok());
    assert_eq!(tx.state(), TxState::Idle);
  }

  #[tokio::test]
  async fn test_exec_without_multi_closes() {
    let cache = FakeCache::default();
    let versions = KeyVersions::new();
    let mut tx = Transaction::new();

    let result = tx.process(command("EXEC"), &cache, &versions).await;
    assert!(matches!(result, RespValue::Error(_)));
    assert!(tx.is_closed());
  }

  #[tokio::test]
  async fn test_watching_executes_plain_commands_directly() {
    let cache = FakeCache::default();
    let versions = KeyVersions::new();
    let mut tx = Transaction::new();

    tx.process(command("WATCH {t}:k"), &cache, &versions).await;
    let result = tx.process(command("GET {t}:k"), &cache, &versions).await;
    assert_eq!(result, RespValue::ok());
    assert_eq!(tx.state(), TxState::Watching);
    assert_eq!(*cache.executed.lock(), vec!["get {t}:k".to_string()]);
  }

  #[test]
  fn test_manager_creates_only_for_watch_and_multi() {
    let manager = TransactionManager::new();
    let conn = Uuid::new_v4();

    assert!(manager.get_or_create(conn, "get").is_none());
    assert!(manager.get_or_create(conn, "multi").is_some());
    assert_eq!(manager.count(), 1);
    // Subsequent commands reuse the bound transaction.
    assert!(manager.get_or_create(conn, "get").is_some());

    assert!(manager.remove(conn));
    assert_eq!(manager.count(), 0);
  }
}
