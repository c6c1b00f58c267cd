//! Order read/write policy.
//!
//! [`OrderService`] is the only component that touches both the store and the
//! cache, and it always touches the store first:
//!
//! - writes go to the store, then the cache (write-through)
//! - point reads try the cache, then fill it from the store (read-through)
//! - full listings always come from the store
//! - deletes evict from the cache only after the store delete succeeded

use std::sync::Arc;

use orderflow_core::{Order, OrderUidError, generate_order_uid, validate_order_uid};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::cache::OrderCache;
use crate::db::{OrderStore, PersistOutcome, RepositoryError};

/// Errors surfaced by the order service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The order identifier is unusable.
    #[error("invalid order: {0}")]
    Invalid(#[from] OrderUidError),

    /// No order with the identifier exists.
    #[error("order {0} not found")]
    NotFound(String),

    /// An order with the identifier already exists.
    #[error("{0}")]
    Conflict(String),

    /// The store failed.
    #[error(transparent)]
    Repository(RepositoryError),
}

impl From<RepositoryError> for ServiceError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Repository(other),
        }
    }
}

/// Read/write facade keeping the cache aligned with the store.
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    cache: Arc<OrderCache>,
}

impl OrderService {
    /// Create a new order service.
    #[must_use]
    pub fn new(store: Arc<dyn OrderStore>, cache: Arc<OrderCache>) -> Self {
        Self { store, cache }
    }

    /// Get a reference to the cache.
    #[must_use]
    pub fn cache(&self) -> &OrderCache {
        &self.cache
    }

    /// Fill the cache with the full store contents.
    ///
    /// Returns the number of cached orders.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError` if the store cannot be read; the cache is left untouched.
    #[instrument(skip(self))]
    pub async fn warm_cache(&self) -> Result<usize, ServiceError> {
        let orders = self.store.get_all().await?;
        self.cache.load_from_db(orders);
        Ok(self.cache.len())
    }

    /// Create an order, generating an identifier when none is supplied.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Invalid` for an unusable identifier,
    /// `ServiceError::Conflict` if it already exists, and
    /// `ServiceError::Repository` if the store fails. The cache is only
    /// updated after the store write succeeded.
    #[instrument(skip(self, order), fields(order_uid = %order.order_uid))]
    pub async fn create(&self, mut order: Order) -> Result<Order, ServiceError> {
        if order.order_uid.is_empty() {
            order.order_uid = generate_order_uid();
        }
        validate_order_uid(&order.order_uid)?;

        let stored = self.store.create(order).await?;
        self.cache.set(stored.clone());
        Ok(stored)
    }

    /// Persist an order delivered by the ingestion stream.
    ///
    /// An order that is already stored is not written again, but the cache is
    /// still refreshed so that readers observe it immediately.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError` if the identifier is unusable or the store fails.
    #[instrument(skip(self, order), fields(order_uid = %order.order_uid))]
    pub async fn ingest(&self, order: Order) -> Result<PersistOutcome, ServiceError> {
        validate_order_uid(&order.order_uid)?;

        let outcome = self.store.create_order_with_associations(order).await?;
        self.cache.set(outcome.order.clone());
        Ok(outcome)
    }

    /// Get an order, reading through the cache.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotFound` if the store has no such order; the
    /// absence is not cached.
    #[instrument(skip(self))]
    pub async fn get_by_id(&self, order_uid: &str) -> Result<Order, ServiceError> {
        if let Some(order) = self.cache.get(order_uid) {
            debug!("Cache hit");
            return Ok(order);
        }

        debug!("Cache miss, reading store");
        let order = self.store.get_by_id(order_uid).await.map_err(|e| match e {
            RepositoryError::NotFound => ServiceError::NotFound(order_uid.to_owned()),
            other => other.into(),
        })?;
        self.cache.set(order.clone());
        Ok(order)
    }

    /// List every stored order. Always served by the store.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Repository` if the store fails.
    #[instrument(skip(self))]
    pub async fn get_all(&self) -> Result<Vec<Order>, ServiceError> {
        Ok(self.store.get_all().await?)
    }

    /// Delete an order. Deleting a missing order succeeds.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Repository` if the store fails; the cache entry
    /// is kept in that case.
    #[instrument(skip(self))]
    pub async fn delete(&self, order_uid: &str) -> Result<(), ServiceError> {
        self.store.delete(order_uid).await?;
        self.cache.delete(order_uid);
        Ok(())
    }
}
