//! Database migration commands.
//!
//! # Usage
//!
//! ```bash
//! of-cli migrate
//! ```
//!
//! # Environment Variables
//!
//! - `ORDERFLOW_DATABASE_URL` - `PostgreSQL` connection string (falls back to `DATABASE_URL`)
//!
//! # Migration Files
//!
//! Migrations live in `crates/server/migrations/` and are embedded at build time:
//! ```text
//! migrations/
//! ├── 20260301000001_create_orders.sql
//! └── 20260301000002_create_stream.sql
//! ```

use orderflow_server::config::{ConfigError, ServerConfig};
use orderflow_server::db;
use thiserror::Error;

/// Errors that can occur while migrating.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Run all pending migrations against the configured database.
///
/// # Errors
///
/// Returns `MigrationError` if the configuration is incomplete, the database
/// is unreachable or a migration fails.
pub async fn run() -> Result<(), MigrationError> {
    let config = ServerConfig::from_env()?;

    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url, 2).await?;

    tracing::info!("Running migrations...");
    sqlx::migrate!("../server/migrations").run(&pool).await?;

    tracing::info!("Migrations complete!");
    pool.close().await;
    Ok(())
}
