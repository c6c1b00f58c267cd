//! Orderflow server binary.
//!
//! Runs the stream consumer and the HTTP API in one process, sharing a single
//! order store and cache.
//!
//! # Startup
//!
//! 1. Load configuration, initialize Sentry and tracing
//! 2. Connect to `PostgreSQL`
//! 3. Warm the cache from the store (failure aborts startup)
//! 4. Spawn the consumer, then serve HTTP
//!
//! On Ctrl+C or SIGTERM the HTTP server drains, the consumer is cancelled and
//! awaited, and the pool is closed.

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::sync::Arc;

use orderflow_server::cache::OrderCache;
use orderflow_server::config::{LogFormat, ServerConfig};
use orderflow_server::consumer::OrderConsumer;
use orderflow_server::db::{self, PgOrderStore};
use orderflow_server::routes;
use orderflow_server::service::OrderService;
use orderflow_server::state::AppState;
use orderflow_server::stream::PgMessageStream;
use sentry::integrations::tracing as sentry_tracing;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &ServerConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

/// Initialize tracing with `EnvFilter`, the configured format and Sentry.
fn init_tracing(format: LogFormat) {
    // Defaults to info level for our crate if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "orderflow_server=info,tower_http=debug".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with((format == LogFormat::Text).then(tracing_subscriber::fmt::layer))
        .with((format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json()))
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();
}

#[tokio::main]
async fn main() {
    // Load configuration from environment (needed for Sentry init)
    let config = ServerConfig::from_env().expect("Failed to load configuration");

    // Initialize Sentry (must be done before tracing subscriber)
    let _sentry_guard = init_sentry(&config);
    init_tracing(config.log_format);
    tracing::debug!(?config, "Configuration loaded");

    let pool = db::create_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to create database pool");
    tracing::info!("Database pool created");

    // NOTE: Migrations are NOT run automatically on startup.
    // Run them explicitly via: cargo run -p orderflow-cli -- migrate

    let store = Arc::new(PgOrderStore::new(pool.clone()));
    let cache = Arc::new(OrderCache::new());
    let service = OrderService::new(store, cache);

    let warmed = service
        .warm_cache()
        .await
        .expect("Failed to warm order cache");
    tracing::info!(orders = warmed, "Order cache warmed");

    // Start the consumer
    let stream = Arc::new(PgMessageStream::new(
        pool.clone(),
        config.stream.topic.clone(),
        config.stream.consumer_group.clone(),
        config.stream.poll_interval,
    ));
    let shutdown = CancellationToken::new();
    let consumer = OrderConsumer::new(stream, service.clone(), config.stream.message_timeout)
        .with_retry_backoff(config.stream.poll_interval);
    let consumer_handle = tokio::spawn(consumer.run(shutdown.child_token()));
    tracing::info!(
        topic = %config.stream.topic,
        group = %config.stream.consumer_group,
        "Order consumer spawned"
    );

    // Build router
    let app = routes::app(AppState::new(service, pool.clone()))
        // Sentry layers (outermost for full request coverage)
        .layer(sentry_tower::NewSentryLayer::new_from_top())
        .layer(sentry_tower::SentryHttpLayer::new().enable_transaction());

    // Start server
    let addr = config.socket_addr();
    tracing::info!("orderflow listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // HTTP is drained; stop the consumer before closing the pool
    shutdown.cancel();
    match consumer_handle.await {
        Ok(stats) => tracing::info!(processed = stats.total(), "Order consumer finished"),
        Err(e) => tracing::error!(error = %e, "Order consumer task failed"),
    }

    pool.close().await;
    tracing::info!("Shutdown complete");
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
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
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
