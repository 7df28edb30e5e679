//! Command parsing: RESP arguments into typed commands carrying their
//! addressed keys and access mode, plus dispatch to the upstream cache.

pub mod transaction;

pub use transaction::{KeyVersions, Transaction, TransactionManager, TxState};

use crate::cache::UpstreamCache;
use crate::events::AccessMode;
use crate::resp::RespValue;

#[derive(Debug, Clone)]
pub enum CommandError {
  Empty,
  Unknown(String),
  WrongArity(String),
  /// Keys addressed by one command must share a single hash tag.
  MixedHashTags,
}

impl std::fmt::Display for CommandError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CommandError::Empty => write!(f, "ERR empty command"),
      CommandError::Unknown(name) => write!(f, "ERR unknown command '{}'", name),
      CommandError::WrongArity(name) => {
        write!(f, "ERR wrong number of arguments for '{}' command", name)
      }
      CommandError::MixedHashTags => {
        write!(f, "ERR keys in command do not share a single hash tag")
      }
    }
  }
}

impl std::error::Error for CommandError {}

/// Where a command's keys sit in its argument list.
#[derive(Debug, Clone, Copy)]
enum KeyLayout {
  /// No keys (PING, MULTI, ...).
  None,
  /// The first argument.
  First,
  /// Every argument (DEL, MGET, WATCH, ...).
  All,
  /// Every second argument starting at the first (MSET).
  Pairs,
}

struct CommandSpec {
  min_args: usize,
  max_args: Option<usize>,
  keys: KeyLayout,
  mode: AccessMode,
}

impl CommandSpec {
  const fn new(
    min_args: usize,
    max_args: Option<usize>,
    keys: KeyLayout,
    mode: AccessMode,
  ) -> Self {
    Self {
      min_args,
      max_args,
      keys,
      mode,
    }
  }
}

/// The parse table: the command subset the dispatcher recognizes (string,
/// list, hash, set and zset families plus transaction control).
fn command_spec(name: &str) -> Option<CommandSpec> {
  use AccessMode::{Read, Write};
  use KeyLayout::{All, First, None as NoKeys, Pairs};

  let spec = match name {
    // connection
    "ping" => CommandSpec::new(0, Some(1), NoKeys, Read),
    "echo" => CommandSpec::new(1, Some(1), NoKeys, Read),

    // strings
    "get" => CommandSpec::new(1, Some(1), First, Read),
    "strlen" => CommandSpec::new(1, Some(1), First, Read),
    "getrange" => CommandSpec::new(3, Some(3), First, Read),
    "mget" => CommandSpec::new(1, None, All, Read),
    "set" => CommandSpec::new(2, None, First, Write),
    "setnx" => CommandSpec::new(2, Some(2), First, Write),
    "setex" => CommandSpec::new(3, Some(3), First, Write),
    "psetex" => CommandSpec::new(3, Some(3), First, Write),
    "getset" => CommandSpec::new(2, Some(2), First, Write),
    "setrange" => CommandSpec::new(3, Some(3), First, Write),
    "append" => CommandSpec::new(2, Some(2), First, Write),
    "incr" => CommandSpec::new(1, Some(1), First, Write),
    "decr" => CommandSpec::new(1, Some(1), First, Write),
    "incrby" => CommandSpec::new(2, Some(2), First, Write),
    "decrby" => CommandSpec::new(2, Some(2), First, Write),
    "incrbyfloat" => CommandSpec::new(2, Some(2), First, Write),
    "mset" => CommandSpec::new(2, None, Pairs, Write),

    // generic key commands
    "del" => CommandSpec::new(1, None, All, Write),
    "unlink" => CommandSpec::new(1, None, All, Write),
    "exists" => CommandSpec::new(1, None, All, Read),
    "type" => CommandSpec::new(1, Some(1), First, Read),
    "ttl" => CommandSpec::new(1, Some(1), First, Read),
    "pttl" => CommandSpec::new(1, Some(1), First, Read),
    "expire" => CommandSpec::new(2, Some(2), First, Write),
    "pexpire" => CommandSpec::new(2, Some(2), First, Write),
    "expireat" => CommandSpec::new(2, Some(2), First, Write),
    "pexpireat" => CommandSpec::new(2, Some(2), First, Write),
    "persist" => CommandSpec::new(1, Some(1), First, Write),

    // lists
    "lpush" => CommandSpec::new(2, None, First, Write),
    "rpush" => CommandSpec::new(2, None, First, Write),
    "lpop" => CommandSpec::new(1, Some(2), First, Write),
    "rpop" => CommandSpec::new(1, Some(2), First, Write),
    "lset" => CommandSpec::new(3, Some(3), First, Write),
    "lrem" => CommandSpec::new(3, Some(3), First, Write),
    "ltrim" => CommandSpec::new(3, Some(3), First, Write),
    "llen" => CommandSpec::new(1, Some(1), First, Read),
    "lrange" => CommandSpec::new(3, Some(3), First, Read),
    "lindex" => CommandSpec::new(2, Some(2), First, Read),

    // hashes
    "hset" => CommandSpec::new(3, None, First, Write),
    "hmset" => CommandSpec::new(3, None, First, Write),
    "hsetnx" => CommandSpec::new(3, Some(3), First, Write),
    "hdel" => CommandSpec::new(2, None, First, Write),
    "hincrby" => CommandSpec::new(3, Some(3), First, Write),
    "hget" => CommandSpec::new(2, Some(2), First, Read),
    "hmget" => CommandSpec::new(2, None, First, Read),
    "hgetall" => CommandSpec::new(1, Some(1), First, Read),
    "hkeys" => CommandSpec::new(1, Some(1), First, Read),
    "hvals" => CommandSpec::new(1, Some(1), First, Read),
    "hlen" => CommandSpec::new(1, Some(1), First, Read),
    "hexists" => CommandSpec::new(2, Some(2), First, Read),

    // sets
    "sadd" => CommandSpec::new(2, None, First, Write),
    "srem" => CommandSpec::new(2, None, First, Write),
    "spop" => CommandSpec::new(1, Some(2), First, Write),
    "smembers" => CommandSpec::new(1, Some(1), First, Read),
    "sismember" => CommandSpec::new(2, Some(2), First, Read),
    "scard" => CommandSpec::new(1, Some(1), First, Read),
    "srandmember" => CommandSpec::new(1, Some(2), First, Read),

    // sorted sets
    "zadd" => CommandSpec::new(3, None, First, Write),
    "zincrby" => CommandSpec::new(3, Some(3), First, Write),
    "zrem" => CommandSpec::new(2, None, First, Write),
    "zscore" => CommandSpec::new(2, Some(2), First, Read),
    "zcard" => CommandSpec::new(1, Some(1), First, Read),
    "zcount" => CommandSpec::new(3, Some(3), First, Read),
    "zrank" => CommandSpec::new(2, Some(2), First, Read),
    "zrange" => CommandSpec::new(3, None, First, Read),
    "zrevrange" => CommandSpec::new(3, None, First, Read),
    "zrangebyscore" => CommandSpec::new(3, None, First, Read),

    // transactions
    "multi" => CommandSpec::new(0, Some(0), NoKeys, Read),
    "exec" => CommandSpec::new(0, Some(0), NoKeys, Read),
    "discard" => CommandSpec::new(0, Some(0), NoKeys, Read),
    "unwatch" => CommandSpec::new(0, Some(0), NoKeys, Read),
    "watch" => CommandSpec::new(1, None, All, Read),

    _ => return None,
  };
  Some(spec)
}

/// A parsed command: canonical name, raw arguments and the keys it addresses.
#[derive(Debug, Clone)]
pub struct Command {
  name: String,
  args: Vec<String>,
  read_keys: Vec<String>,
  write_keys: Vec<String>,
}

impl Command {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn args(&self) -> &[String] {
    &self.args
  }

  pub fn read_keys(&self) -> &[String] {
    &self.read_keys
  }

  pub fn write_keys(&self) -> &[String] {
    &self.write_keys
  }

  /// All addressed keys, reads first.
  pub fn keys(&self) -> Vec<String> {
    let mut keys = self.read_keys.clone();
    keys.extend(self.write_keys.iter().cloned());
    keys
  }

  pub fn access_mode(&self) -> AccessMode {
    if self.write_keys.is_empty() {
      AccessMode::Read
    } else {
      AccessMode::Write
    }
  }

  /// The single hash tag shared by every addressed key. Empty when the
  /// command addresses no keys or only tagless keys.
  pub fn keys_hash_tag(&self) -> Result<String, CommandError> {
    let mut tag: Option<&str> = None;
    for key in self.read_keys.iter().chain(self.write_keys.iter()) {
      let key_tag = extract_hash_tag(key);
      match tag {
        None => tag = Some(key_tag),
        Some(prev) if prev != key_tag => return Err(CommandError::MixedHashTags),
        Some(_) => {}
      }
    }
    Ok(tag.unwrap_or("").to_string())
  }
}

impl std::fmt::Display for Command {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.name, self.args.join(" "))
  }
}

/// Parse RESP command parts into a typed command.
pub fn parse_command(parts: &[String]) -> Result<Command, CommandError> {
  let Some(raw_name) = parts.first() else {
    return Err(CommandError::Empty);
  };
  let name = raw_name.to_lowercase();
  let args: Vec<String> = parts[1..].to_vec();

  let spec = command_spec(&name).ok_or_else(|| CommandError::Unknown(name.clone()))?;
  if args.len() < spec.min_args {
    return Err(CommandError::WrongArity(name));
  }
  if let Some(max) = spec.max_args {
    if args.len() > max {
      return Err(CommandError::WrongArity(name));
    }
  }

  let keys: Vec<String> = match spec.keys {
    KeyLayout::None => Vec::new(),
    KeyLayout::First => vec![args[0].clone()],
    KeyLayout::All => args.clone(),
    KeyLayout::Pairs => {
      if args.len() % 2 != 0 {
        return Err(CommandError::WrongArity(name));
      }
      args.iter().step_by(2).cloned().collect()
    }
  };
  let (read_keys, write_keys) = match spec.mode {
    AccessMode::Read => (keys, Vec::new()),
    AccessMode::Write => (Vec::new(), keys),
  };

  Ok(Command {
    name,
    args,
    read_keys,
    write_keys,
  })
}

/// The substring of a key between the first `{` and the following `}`.
pub fn extract_hash_tag(key: &str) -> &str {
  if let Some(open) = key.find('{') {
    if let Some(close) = key[open + 1..].find('}') {
      return &key[open + 1..open + 1 + close];
    }
  }
  ""
}

/// Run one command against the upstream cluster, relaying errors as RESP
/// error replies.
pub async fn execute_command(cache: &dyn UpstreamCache, command: &Command) -> RespValue {
  match cache.execute(command.name(), command.args()).await {
    Ok(value) => value,
    Err(e) => RespValue::error(&e.to_string()),
  }
}
