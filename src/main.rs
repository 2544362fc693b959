//! authz_shard - sharded authorization service
//!
//! One binary, two roles: a shard node persisting and answering its slice of
//! the hash space, or an operation router fronting the shard groups during
//! normal serving and online re-sharding.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use authz_shard::api::{self, AppState, RouterState};
use authz_shard::buffer::{EventBuffer, FlushWorker};
use authz_shard::cache::EventCache;
use authz_shard::config::{Config, ServerRole};
use authz_shard::db;
use authz_shard::event_store::TemporalEventStore;
use authz_shard::metrics::{MetricLogWorker, MetricRegistry, TripSwitch};
use authz_shard::processor::BulkEventProcessor;
use authz_shard::query::QueryService;
use authz_shard::sharding::OperationRouter;

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authz_shard=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Build the shard-node application: store, buffer, cache, workers.
async fn build_shard_app(config: &Config) -> anyhow::Result<(Router, PgPool)> {
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.storage.max_connections)
        .connect(&config.storage.url)
        .await?;

    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }
    tracing::info!("Database connected successfully");

    let store = TemporalEventStore::with_retry(
        pool.clone(),
        config.retry.max_attempts,
        Duration::from_millis(config.retry.backoff_ms),
    );
    let processor = BulkEventProcessor::new(store);
    let buffer = Arc::new(EventBuffer::new(config.buffering.buffer_size_limit));
    let cache = Arc::new(EventCache::new(config.caching.cached_event_count));
    let trip_switch = Arc::new(TripSwitch::new());
    let metrics = Arc::new(MetricRegistry::new());

    FlushWorker::new(
        Arc::clone(&buffer),
        processor.clone(),
        Arc::clone(&cache),
        Arc::clone(&trip_switch),
        Arc::clone(&metrics),
        Duration::from_millis(config.buffering.flush_loop_interval_ms),
    )
    .start();

    MetricLogWorker::new(
        Arc::clone(&metrics),
        Duration::from_millis(config.metrics.log_interval_ms),
    )
    .start();

    let state = AppState {
        pool: pool.clone(),
        buffer,
        cache,
        processor,
        queries: QueryService::new(pool.clone()),
        trip_switch,
        metrics,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(api::create_router().with_state(state))
        .layer(TraceLayer::new_for_http());

    Ok((app, pool))
}

/// Build the router-node application: shard client groups and control plane.
fn build_router_app(config: &Config) -> anyhow::Result<Router> {
    let routing = config
        .routing
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("router role requires a [routing] section"))?;

    let router = OperationRouter::new(
        &routing.source_items(),
        &routing.target_items(),
        routing.window(),
        routing.routing_initially_on,
    )?;

    let metrics = Arc::new(MetricRegistry::new());
    MetricLogWorker::new(
        Arc::clone(&metrics),
        Duration::from_millis(config.metrics.log_interval_ms),
    )
    .start();

    let state = RouterState {
        router: Arc::new(router),
        metrics,
    };

    Ok(Router::new()
        .route("/health", get(health_check))
        .merge(api::create_routed_router().with_state(state))
        .layer(TraceLayer::new_for_http()))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config.socket_addr()?;

    let (app, pool) = match config.server.role {
        ServerRole::Shard => {
            tracing::info!("Starting authz_shard shard node");
            let (app, pool) = build_shard_app(&config).await?;
            (app, Some(pool))
        }
        ServerRole::Router => {
            tracing::info!("Starting authz_shard operation router");
            (build_router_app(&config)?, None)
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutting down...");
    if let Some(pool) = pool {
        pool.close().await;
        tracing::info!("Database connections closed. Goodbye!");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "authz_shard.toml".to_string());

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Configuration rejected");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            ExitCode::from(2)
        }
    }
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
