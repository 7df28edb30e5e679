//! roomdb: a RESP-speaking proxy that fronts a Redis-compatible cache with a
//! sharded Postgres store of record.
//!
//! Clients speak the Redis wire protocol; the proxy hydrates a hash-tag-scoped
//! working set from storage on first access, serves subsequent commands from
//! the cache, and reports asynchronous access events that drive background
//! persistence and eviction.

pub mod cache;
pub mod commands;
pub mod config;
pub mod events;
pub mod loader;
pub mod metrics;
pub mod resp;
pub mod server;
pub mod shard;
pub mod storage;

pub use config::ServerConfig;
pub use metrics::Metrics;
pub use resp::{RespError, RespValue};
pub use server::{Dependencies, RoomServer};
