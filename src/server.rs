//! Connection server: accepts RESP clients and drives each command through
//! parse, hash-tag validation, hydration, transaction-or-direct execution,
//! response encoding and event emission.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::UpstreamCache;
use crate::commands::{parse_command, KeyVersions, TransactionManager};
use crate::config::ServerSection;
use crate::events::EventService;
use crate::loader::Loader;
use crate::metrics::Metrics;
use crate::resp::{extract_command, RespParser, RespValue};
use crate::shard::DbCluster;

/// The process-wide dependency record, threaded explicitly from the binary.
/// The record clusters back the sweep surface; the serving path itself only
/// reads documents through the loader.
#[derive(Clone)]
pub struct Dependencies {
  pub data_db: Arc<DbCluster>,
  pub accessed_record_db: Arc<DbCluster>,
  pub written_record_db: Arc<DbCluster>,
  pub loader: Arc<Loader>,
  pub cache: Arc<dyn UpstreamCache>,
  pub events: Arc<EventService>,
  pub metrics: Arc<Metrics>,
  pub key_versions: Arc<KeyVersions>,
  pub transactions: Arc<TransactionManager>,
}

/// Serve one parsed RESP command for a connection and return the reply.
pub async fn serve_command(
  deps: &Dependencies,
  conn_id: Uuid,
  ctx: &CancellationToken,
  parts: &[String],
) -> RespValue {
  let serve_start = chrono::Utc::now();
  deps.metrics.incr(&deps.metrics.command_total);

  let command = match parse_command(parts) {
    Ok(command) => command,
    Err(e) => {
      deps.metrics.incr(&deps.metrics.parse_command_errors);
      tracing::error!(command = %parts.join(" "), error = %e, "parse command failed");
      return RespValue::error(&e.to_string());
    }
  };

  let hash_tag = match command.keys_hash_tag() {
    Ok(hash_tag) => hash_tag,
    Err(e) => {
      deps.metrics.incr(&deps.metrics.parse_command_errors);
      tracing::error!(command = %command, error = %e, "hash tag validation failed");
      return RespValue::error(&e.to_string());
    }
  };

  // Tagless commands need no hydration and emit no event.
  if !hash_tag.is_empty() {
    if let Err(e) = deps
      .loader
      .load(ctx, &hash_tag, serve_start, command.access_mode())
      .await
    {
      deps.metrics.incr(&deps.metrics.load_errors);
      tracing::error!(command = %command, hash_tag, error = %e, "load hash_tag failed");
      return RespValue::error(&format!("ERR load data error, {}", e));
    }
  }

  let had_transaction = deps.transactions.get(conn_id).is_some();
  let transaction = deps.transactions.get_or_create(conn_id, command.name());
  if !had_transaction && transaction.is_some() {
    deps.metrics.transaction_opened();
    tracing::debug!(command = %command.name(), %conn_id, "create transaction");
  }

  let keys = command.keys();
  let access_mode = command.access_mode();
  let response = match transaction {
    Some(transaction) => {
      let mut tx = transaction.lock().await;
      let response = tx
        .process(command, deps.cache.as_ref(), &deps.key_versions)
        .await;
      if tx.is_closed() && deps.transactions.remove(conn_id) {
        deps.metrics.transaction_closed();
      }
      response
    }
    None => {
      let result = crate::commands::execute_command(deps.cache.as_ref(), &command).await;
      if !matches!(result, RespValue::Error(_)) {
        deps.key_versions.bump_all(command.write_keys());
      }
      result
    }
  };

  if !hash_tag.is_empty() {
    if let Err(e) = deps
      .events
      .send_event(&hash_tag, &keys, access_mode, serve_start)
    {
      deps.metrics.incr(&deps.metrics.send_event_errors);
      tracing::warn!(hash_tag, error = %e, "send event failed");
    }
  }

  response
}

/// The RESP-speaking proxy server.
pub struct RoomServer {
  config: ServerSection,
  deps: Dependencies,
  shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl RoomServer {
  pub fn new(config: ServerSection, deps: Dependencies) -> Self {
    Self {
      config,
      deps,
      shutdown_tx: Mutex::new(None),
    }
  }

  /// Bind and serve until `shutdown` is called. Each accepted connection is
  /// served by its own task.
  pub async fn run(&self) -> Result<(), anyhow::Error> {
    let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
      .parse()
      .map_err(|e| anyhow::anyhow!("invalid server address: {}", e))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    *self.shutdown_tx.lock() = Some(shutdown_tx);

    loop {
      tokio::select! {
        result = listener.accept() => {
          match result {
            Ok((socket, peer)) => {
              let deps = self.deps.clone();
              tokio::spawn(async move {
                if let Err(e) = handle_client(socket, peer, deps).await {
                  tracing::debug!(%peer, error = %e, "client connection error");
                }
              });
            }
            Err(e) => {
              tracing::error!(error = %e, "accept failed");
            }
          }
        }
        _ = &mut shutdown_rx => {
          tracing::info!("server shutting down");
          break;
        }
      }
    }
    Ok(())
  }

  pub fn shutdown(&self) {
    if let Some(tx) = self.shutdown_tx.lock().take() {
      let _ = tx.send(());
    }
  }
}

async fn handle_client(
  mut socket: TcpStream,
  peer: SocketAddr,
  deps: Dependencies,
) -> Result<(), anyhow::Error> {
  let conn_id = Uuid::new_v4();
  let connections = deps.metrics.connection_opened();
  tracing::debug!(%peer, %conn_id, connections, "client connected");

  // Cancels in-flight storage reads when the connection task ends.
  let ctx = CancellationToken::new();
  let _cancel_guard = ctx.clone().drop_guard();

  let result = serve_connection(&mut socket, conn_id, &ctx, &deps).await;
  close_connection(&deps, conn_id, peer);
  result
}

async fn serve_connection(
  socket: &mut TcpStream,
  conn_id: Uuid,
  ctx: &CancellationToken,
  deps: &Dependencies,
) -> Result<(), anyhow::Error> {
  let mut parser = RespParser::new();
  let mut buf = [0u8; 4096];

  loop {
    let n = socket.read(&mut buf).await?;
    if n == 0 {
      return Ok(());
    }
    parser.feed(&buf[..n]);

    loop {
      let value = match parser.parse() {
        Ok(Some(value)) => value,
        Ok(None) => break,
        Err(e) => {
          // Protocol garbage: report and drop the connection.
          socket
            .write_all(&RespValue::error(&format!("ERR {}", e)).encode())
            .await?;
          return Err(anyhow::anyhow!("invalid RESP from client: {}", e));
        }
      };
      let response = match extract_command(&value) {
        Some((name, args)) => {
          if name == "QUIT" {
            socket.write_all(&RespValue::ok().encode()).await?;
            return Ok(());
          }
          let mut parts = Vec::with_capacity(args.len() + 1);
          parts.push(name);
          parts.extend(args);
          serve_command(deps, conn_id, ctx, &parts).await
        }
        None => RespValue::error("ERR invalid command format"),
      };
      socket.write_all(&response.encode()).await?;
    }
  }
}

fn close_connection(deps: &Dependencies, conn_id: Uuid, peer: SocketAddr) {
  if deps.transactions.remove(conn_id) {
    deps.metrics.transaction_closed();
  }
  let connections = deps.metrics.connection_closed();
  tracing::debug!(%peer, %conn_id, connections, "client disconnected");
}
