use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use turnstile::config::{StoreBackend, TurnstileConfig};
use turnstile::http::{build_router, extractor_for, RateLimitState};
use turnstile::metrics::Metrics;
use turnstile::ratelimit::AdmissionGate;
use turnstile::server::HttpServer;
use turnstile::store::{CounterStore, MemoryStore, RedisStore};

/// Request admission gate for the finance tracker API.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Turnstile admission gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Invalid limits or windows stop the process here, before any request
    let config = TurnstileConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        limit = config.rate_limiting.limit,
        window_secs = config.rate_limiting.window_secs,
        failure_policy = config.rate_limiting.failure_policy.as_str(),
        "Configuration loaded"
    );

    let metrics = Arc::new(Metrics::new());
    let store = open_store(&config).await?;

    let gate = AdmissionGate::from_config(store, &config.rate_limiting)
        .context("failed to build admission gate")?
        .with_key_prefix(config.store.key_prefix.clone())
        .with_metrics(metrics.clone());
    info!(gate = ?gate, "Admission gate initialized");

    let rate_limit = RateLimitState::new(Arc::new(gate))
        .with_extractor(extractor_for(config.rate_limiting.identity));

    let router = build_router(Router::new(), rate_limit, metrics);

    HttpServer::new(config.server.http_addr, router)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Turnstile admission gate stopped");
    Ok(())
}

async fn open_store(config: &TurnstileConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.store.backend {
        StoreBackend::Redis => {
            let redis = config.store.redis();
            let connect_timeout = redis.connect_timeout;
            let store = RedisStore::connect(redis).context("failed to create redis client")?;

            if store.wait_connected(connect_timeout).await {
                info!("Counter store ready");
            } else {
                // Keep starting; requests are handled by the failure policy
                // until the supervisor gets a connection.
                warn!(
                    failure_policy = config.rate_limiting.failure_policy.as_str(),
                    "Counter store not reachable yet, starting anyway"
                );
            }
            let store: Arc<dyn CounterStore> = Arc::new(store);
            Ok(store)
        }
        StoreBackend::Memory => {
            warn!("Using in-process counter store; limits are not shared between instances");
            let store = Arc::new(MemoryStore::new());
            spawn_sweeper(
                store.clone(),
                Duration::from_secs(config.rate_limiting.window_secs),
            );
            let store: Arc<dyn CounterStore> = store;
            Ok(store)
        }
    }
}

/// Periodically drop expired in-process counters.
fn spawn_sweeper(store: Arc<MemoryStore>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(purged, remaining = store.len(), "Purged expired counters");
            }
        }
    });
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_thread_ids(true))
            .init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
