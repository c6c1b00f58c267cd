//! Durable order storage.
//!
//! # Database: `orderflow`
//!
//! ## Tables
//!
//! - `orders` - Order root rows, keyed by `order_uid`
//! - `deliveries` - One delivery per order (`<id>_<order_uid>` keys)
//! - `payments` - One payment per order
//! - `items` - Ordered line items per order
//! - `stream_messages`, `stream_offsets`, `stream_dead_letters` - Ingestion log
//!   (see [`crate::stream`])
//!
//! # Migrations
//!
//! Migrations are stored in `crates/server/migrations/` and run via:
//! ```bash
//! cargo run -p orderflow-cli -- migrate
//! ```

pub mod orders;

use std::time::Duration;

use async_trait::async_trait;
use orderflow_core::Order;
use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

pub use orders::PgOrderStore;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation (e.g., duplicate order identifier).
    #[error("constraint violation: {0}")]
    Conflict(String),

    /// An owned record id is already used by another order.
    #[error("record id collision: {0}")]
    RecordCollision(String),
}

/// Result of an idempotent order insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOutcome {
    /// The order as it is stored, with derived record ids.
    pub order: Order,
    /// `false` when the order already existed and nothing was written.
    pub created: bool,
}

/// Transactional order persistence.
///
/// Every write covers the order and all of its owned records in a single
/// transaction; readers never observe a partially stored order.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a new order with its delivery, payment and items.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Conflict` if the order identifier already
    /// exists, or `RepositoryError::RecordCollision` if an owned record id is
    /// taken by another order.
    async fn create(&self, order: Order) -> Result<Order, RepositoryError>;

    /// Insert an order unless its identifier already exists.
    ///
    /// An existing identifier is a successful no-op reported through
    /// [`PersistOutcome::created`].
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError` if any insert fails; nothing is written then.
    async fn create_order_with_associations(
        &self,
        order: Order,
    ) -> Result<PersistOutcome, RepositoryError>;

    /// Load every stored order with its owned records.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError` if the read fails.
    async fn get_all(&self) -> Result<Vec<Order>, RepositoryError>;

    /// Load one order with its owned records.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NotFound` if the identifier is absent.
    async fn get_by_id(&self, order_uid: &str) -> Result<Order, RepositoryError>;

    /// Delete an order and all of its owned records. Missing orders are ignored.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError` if the delete fails; nothing is removed then.
    async fn delete(&self, order_uid: &str) -> Result<(), RepositoryError>;
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Arguments
///
/// * `database_url` - `PostgreSQL` connection string (wrapped in `SecretString`)
/// * `max_connections` - Upper bound on pooled connections
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(
    database_url: &secrecy::SecretString,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}

/// Map a unique-constraint violation on an owned record to
/// `RepositoryError::RecordCollision`.
///
/// The order row itself is guarded by `ON CONFLICT`, so a violation here means
/// the derived record id belongs to a different order.
pub(crate) fn map_record_collision(e: sqlx::Error, what: &str) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.is_unique_violation()
    {
        return RepositoryError::RecordCollision(format!("{what} id is used by another order"));
    }
    RepositoryError::Database(e)
}
