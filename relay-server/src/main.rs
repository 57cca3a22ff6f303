//! Relay server 入口

use anyhow::Result;
use clap::Parser;
use relay_logic::{RelayConfig, RelayService};
use relay_server::build_router;
use relay_server::config::{Args, StoreKind};
use relay_store::{RedisStore, SqliteStore, StoreAdapter};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting relay server...");

    // 存储后端只在启动时选一次
    let store: Arc<dyn StoreAdapter> = match args.store {
        StoreKind::Redis => {
            info!(
                "Using Redis store: {}:{} (prefix {})",
                args.redis_host, args.redis_port, args.redis_prefix
            );
            Arc::new(RedisStore::connect_with(args.redis_config()).await?)
        }
        StoreKind::Sqlite => {
            info!("Using SQLite store: {:?}", args.sqlite_path);
            Arc::new(SqliteStore::open(&args.sqlite_path)?)
        }
    };
    store.ping().await?;

    let service = Arc::new(RelayService::new(store, RelayConfig::default()));
    let app = build_router(service);

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!("Listening on {}", args.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Relay server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down...");
}
