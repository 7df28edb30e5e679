use clap::Parser;
use roomdb::cache::RedisUpstream;
use roomdb::commands::{KeyVersions, TransactionManager};
use roomdb::events::EventService;
use roomdb::loader::Loader;
use roomdb::shard::DbCluster;
use roomdb::storage::PgDataStore;
use roomdb::{Dependencies, Metrics, RoomServer, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "roomd", about = "RESP proxy over a sharded store of record", version)]
struct Args {
  #[arg(short, long, env = "ROOMDB_CONFIG")]
  config: String,
  #[arg(long)]
  host: Option<String>,
  #[arg(short, long)]
  port: Option<u16>,
  #[arg(long)]
  log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  let mut config = ServerConfig::from_file(&args.config)?;
  if let Some(host) = args.host {
    config.server.host = host;
  }
  if let Some(port) = args.port {
    config.server.port = port;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let data_db = Arc::new(DbCluster::from_config(&config.data_db)?);
  let accessed_record_db = Arc::new(DbCluster::from_config(&config.accessed_record_db)?);
  let written_record_db = Arc::new(DbCluster::from_config(&config.written_record_db)?);

  let upstream = RedisUpstream::connect(&config.redis).await?;
  upstream.test_connection().await?;
  tracing::info!(
    host = %config.redis.host,
    port = config.redis.port,
    "connected to upstream redis"
  );
  let cache: Arc<dyn roomdb::cache::UpstreamCache> = Arc::new(upstream);

  let metrics = Arc::new(Metrics::new());
  let events = EventService::new(config.event_service.clone(), metrics.clone())?;
  events.start();

  let store = Arc::new(PgDataStore::new(data_db.clone()));
  let loader = Arc::new(Loader::new(store, cache.clone()));

  let deps = Dependencies {
    data_db,
    accessed_record_db,
    written_record_db,
    loader,
    cache,
    events: events.clone(),
    metrics,
    key_versions: Arc::new(KeyVersions::new()),
    transactions: Arc::new(TransactionManager::new()),
  };

  let server = Arc::new(RoomServer::new(config.server.clone(), deps));
  let signal_server = server.clone();
  let signal_events = events.clone();
  tokio::spawn(async move {
    shutdown_signal().await;
    signal_server.shutdown();
    signal_events.stop().await;

    // Give in-flight connections a moment to finish their replies.
    tokio::time::sleep(Duration::from_secs(1)).await;
    tracing::info!("shutdown complete");
    std::process::exit(0);
  });

  server.run().await
}

async fn shutdown_signal() {
  let ctrl_c = async {
    tokio::signal::ctrl_c()
      .await
      .expect("failed to install Ctrl+C handler");
  };

  #[cfg(unix)]
  let terminate = async {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
      .expect("failed to install SIGTERM handler")
      .recv()
      .await;
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("received SIGINT"),
    _ = terminate => tracing::info!("received SIGTERM"),
  }
}
