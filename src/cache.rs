//! Upstream cache client: the Redis cluster the proxy serves commands from.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;

use crate::config::RedisSection;
use crate::resp::RespValue;
use crate::storage::ZsetMember;

/// Error from the upstream cluster, formatted the way a Redis server reports
/// it so it can be relayed to the client verbatim.
#[derive(Debug, Clone)]
pub struct CacheError(String);

impl CacheError {
  pub fn new(msg: impl Into<String>) -> Self {
    Self(msg.into())
  }
}

impl std::fmt::Display for CacheError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl std::error::Error for CacheError {}

impl From<redis::RedisError> for CacheError {
  fn from(e: redis::RedisError) -> Self {
    match (e.code(), e.detail()) {
      (Some(code), Some(detail)) => CacheError(format!("{} {}", code, detail)),
      _ => CacheError(format!("ERR {}", e)),
    }
  }
}

/// Commands the proxy issues against the upstream cluster: the generic
/// passthrough plus the primitives the load engine hydrates with.
#[async_trait]
pub trait UpstreamCache: Send + Sync {
  /// Execute an arbitrary command and return its reply.
  async fn execute(&self, name: &str, args: &[String]) -> Result<RespValue, CacheError>;

  async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;
  async fn rpush(&self, key: &str, elements: &[String]) -> Result<(), CacheError>;
  async fn hset(&self, key: &str, fields: &HashMap<String, String>) -> Result<(), CacheError>;
  async fn sadd(&self, key: &str, members: &[String]) -> Result<(), CacheError>;
  async fn zadd(&self, key: &str, members: &[ZsetMember]) -> Result<(), CacheError>;
  async fn pexpire_at(&self, key: &str, at_ms: i64) -> Result<(), CacheError>;
}

/// Upstream client over a managed connection; reconnects are handled by the
/// connection manager.
pub struct RedisUpstream {
  connection: ConnectionManager,
}

impl RedisUpstream {
  pub async fn connect(config: &RedisSection) -> Result<Self, CacheError> {
    let client = redis::Client::open(config.connection_url())?;
    let connection = ConnectionManager::new(client).await?;
    Ok(Self { connection })
  }

  /// Round-trip a PING to verify the cluster is reachable.
  pub async fn test_connection(&self) -> Result<(), CacheError> {
    let mut conn = self.connection.clone();
    redis::cmd("PING").query_async::<()>(&mut conn).await?;
    Ok(())
  }
}

#[async_trait]
impl UpstreamCache for RedisUpstream {
  async fn execute(&self, name: &str, args: &[String]) -> Result<RespValue, CacheError> {
    let mut cmd = redis::cmd(name);
    for arg in args {
      cmd.arg(arg);
    }
    let mut conn = self.connection.clone();
    let value: redis::Value = cmd.query_async(&mut conn).await?;
    Ok(RespValue::from(value))
  }

  async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
    let mut conn = self.connection.clone();
    conn.set::<_, _, ()>(key, value).await?;
    Ok(())
  }

  async fn rpush(&self, key: &str, elements: &[String]) -> Result<(), CacheError> {
    let mut conn = self.connection.clone();
    conn.rpush::<_, _, ()>(key, elements).await?;
    Ok(())
  }

  async fn hset(&self, key: &str, fields: &HashMap<String, String>) -> Result<(), CacheError> {
    let pairs: Vec<(&str, &str)> = fields
      .iter()
      .map(|(field, value)| (field.as_str(), value.as_str()))
      .collect();
    let mut conn = self.connection.clone();
    conn.hset_multiple::<_, _, _, ()>(key, &pairs).await?;
    Ok(())
  }

  async fn sadd(&self, key: &str, members: &[String]) -> Result<(), CacheError> {
    let mut conn = self.connection.clone();
    conn.sadd::<_, _, ()>(key, members).await?;
    Ok(())
  }

  async fn zadd(&self, key: &str, members: &[ZsetMember]) -> Result<(), CacheError> {
    let pairs: Vec<(f64, &str)> = members
      .iter()
      .map(|m| (m.score, m.member.as_str()))
      .collect();
    let mut conn = self.connection.clone();
    conn.zadd_multiple::<_, _, _, ()>(key, &pairs).await?;
    Ok(())
  }

  async fn pexpire_at(&self, key: &str, at_ms: i64) -> Result<(), CacheError> {
    let mut conn = self.connection.clone();
    conn.pexpire_at::<_, ()>(key, at_ms).await?;
    Ok(())
  }
}
