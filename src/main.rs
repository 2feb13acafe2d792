use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use turnstile::admission::AdmissionPipeline;
use turnstile::config::{LogFormat, TurnstileConfig};
use turnstile::grpc::GrpcServer;
use turnstile::store::{AccountingStore, FallbackStore, LocalStore, RedisStore};

/// Adaptive distributed admission control service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format, overriding the configuration
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Log filter directive, overriding the configuration
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    turnstile::logging::init(&config.logging)?;

    info!("Starting Turnstile Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        tiers = config.limits.tiers.len(),
        endpoint_overrides = config.limits.endpoints.len(),
        "Configuration loaded"
    );

    let local = Arc::new(LocalStore::new(config.store.local_capacity));
    let store: Arc<dyn AccountingStore> = match config.store.redis() {
        Some(redis_config) => {
            info!(url = %redis_config.url, "Using shared Redis accounting store");
            let redis = RedisStore::new(redis_config)?;
            Arc::new(FallbackStore::new(
                Arc::new(redis),
                local.clone(),
                config.store.timeout(),
                config.store.unhealthy_cooldown(),
            ))
        }
        None => {
            warn!("No Redis URL configured, limits are enforced per instance");
            local.clone()
        }
    };

    let pipeline = Arc::new(AdmissionPipeline::new(store, &config.pipeline()));
    info!(store = pipeline.store_name(), "Admission pipeline initialized");

    // Periodically drop expired local entries.
    let cleanup_interval = config.store.cleanup_interval();
    let cleanup_store = local.clone();
    let cleanup_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        loop {
            interval.tick().await;
            let purged = cleanup_store.purge_expired(chrono::Utc::now());
            if purged > 0 {
                tracing::debug!(purged = purged, remaining = cleanup_store.len(), "Purged local entries");
            }
        }
    });

    // Keep a subscriber attached so lagging is visible in the logs.
    let mut events = pipeline.subscribe();
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let Err(e) = event {
                warn!(error = %e, "Admission event subscriber lagged");
            }
        }
    });

    let grpc_server = GrpcServer::new(config.server.grpc_addr, pipeline.clone());

    info!("Starting gRPC server on {}", config.server.grpc_addr);

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    cleanup_task.abort();
    event_task.abort();

    let stats = pipeline.stats();
    info!(
        admitted = stats.admitted,
        limited = stats.limited,
        burst = stats.burst,
        blocked = stats.blocked,
        degraded = stats.degraded,
        "Turnstile Admission Service stopped"
    );
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
