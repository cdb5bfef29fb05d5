//! Tidemark ingestion daemon.
//!
//! Subscribes to the repo-commit stream of an upstream service and keeps the
//! SQLite index current. Several instances may point at the same database;
//! only the lease holder consumes.
//!
//! # Usage
//!
//! ```bash
//! # Default upstream and database
//! tidemark-ingest
//!
//! # Custom upstream, database and ports
//! tidemark-ingest \
//!     --service wss://relay.example \
//!     --db-path /data/tidemark.db \
//!     --metrics-port 9090 \
//!     --health-port 8080
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT (Ctrl+C) the subscription is destroyed: the in-flight message
//! transaction rolls back, the lease is released and the process exits.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tidemark_core::metrics::{init_metrics, start_metrics_server};
use tidemark_ingest::health::start_health_server;
use tidemark_ingest::subscription::{LeaderConfig, RetryPolicy};
use tidemark_ingest::{
    ChannelSink, Database, DatabaseConfig, EventSink, IndexingService, LogSink, RepoSubscription,
    SubscriptionConfig, WebSocketTransport,
};
use tracing_subscriber::EnvFilter;

/// Tidemark ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "tidemark-ingest")]
#[command(about = "Leader-elected repo-commit stream indexer")]
#[command(version)]
struct Args {
    /// SQLite database path
    #[arg(long, env = "TIDEMARK_DB_PATH", default_value = "./data/tidemark.db")]
    db_path: PathBuf,

    /// Upstream service URL
    #[arg(long, env = "TIDEMARK_SERVICE", default_value = "wss://bsky.network")]
    service: String,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "TIDEMARK_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Health HTTP server port (0 to disable)
    #[arg(long, env = "TIDEMARK_HEALTH_PORT", default_value = "8080")]
    health_port: u16,

    /// Subscription lease lifetime in seconds
    #[arg(long, env = "TIDEMARK_LEASE_TTL_SECS", default_value = "30")]
    lease_ttl_secs: u64,

    /// Base delay between failed subscription cycles
    #[arg(long, env = "TIDEMARK_RETRY_BASE_MS", default_value = "5000")]
    retry_base_ms: u64,

    /// Maximum jitter applied to the retry delay, in either direction
    #[arg(long, env = "TIDEMARK_RETRY_JITTER_MS", default_value = "1000")]
    retry_jitter_ms: u64,

    /// Lease holder name (random if unset)
    #[arg(long, env = "TIDEMARK_HOLDER_ID")]
    holder_id: Option<String>,

    /// Log derived events instead of forwarding them to the consumer task
    #[arg(long)]
    log_events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("tidemark_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Tidemark ingestion daemon starting...");

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
    }

    let db_config = DatabaseConfig {
        path: args.db_path.clone(),
        ..Default::default()
    };
    let db = Arc::new(
        Database::open(&db_config)
            .with_context(|| format!("Failed to open database at {:?}", args.db_path))?,
    );

    let config = SubscriptionConfig {
        holder: args.holder_id.clone(),
        retry: RetryPolicy {
            base: Duration::from_millis(args.retry_base_ms),
            jitter: Duration::from_millis(args.retry_jitter_ms),
        },
        leader: LeaderConfig::with_ttl(Duration::from_secs(args.lease_ttl_secs.max(1))),
        ..SubscriptionConfig::new(args.service.clone())
    };

    tracing::info!("Configuration:");
    tracing::info!("  Database: {}", args.db_path.display());
    tracing::info!("  Service: {}", config.service);
    tracing::info!("  Lease TTL: {:?}", config.leader.ttl);
    tracing::info!(
        "  Retry: {:?} ± {:?}",
        config.retry.base,
        config.retry.jitter
    );

    let sink: Arc<dyn EventSink> = if args.log_events {
        Arc::new(LogSink)
    } else {
        let (sink, mut rx) = ChannelSink::channel(10_000);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                tracing::debug!(kind = message.kind(), "Event ready for delivery");
            }
        });
        Arc::new(sink)
    };

    let transport = Arc::new(WebSocketTransport::new(
        config.service.clone(),
        config.method.clone(),
    ));
    let subscription = Arc::new(RepoSubscription::new(
        config,
        Arc::clone(&db),
        Arc::new(IndexingService::new()),
        transport,
        sink,
    ));
    tracing::info!(holder = %subscription.holder(), "Subscription ready");

    if args.health_port > 0 {
        start_health_server(args.health_port, Arc::clone(&subscription)).await?;
    }

    let handler_subscription = Arc::clone(&subscription);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        handler_subscription.destroy();
    })
    .context("Failed to set Ctrl+C handler")?;

    subscription.run().await;

    let state = subscription.get_state().await?;
    tracing::info!(cursor = state.cursor, "Shutdown complete");

    Ok(())
}
