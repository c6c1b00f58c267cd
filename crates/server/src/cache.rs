//! In-memory order cache.
//!
//! Maps order identifiers to fully materialized orders. The store remains the
//! source of truth; the cache only ever holds orders that were persisted.
//!
//! All operations take a single `RwLock` briefly and never await while holding
//! it. [`OrderCache::load_from_db`] builds the replacement map before taking
//! the write lock so that only the swap itself is serialized.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use orderflow_core::Order;

/// Concurrent map from order identifier to order.
#[derive(Debug, Default)]
pub struct OrderCache {
    orders: RwLock<HashMap<String, Order>>,
}

impl OrderCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for the order's identifier.
    pub fn set(&self, order: Order) {
        self.write().insert(order.order_uid.clone(), order);
    }

    /// Look up an order. `None` means the store must be asked.
    #[must_use]
    pub fn get(&self, order_uid: &str) -> Option<Order> {
        self.read().get(order_uid).cloned()
    }

    /// Remove the entry for an identifier, if present.
    pub fn delete(&self, order_uid: &str) {
        self.write().remove(order_uid);
    }

    /// Replace the entire contents with `orders`.
    ///
    /// Readers observe either the previous mapping or the complete new one.
    pub fn load_from_db(&self, orders: Vec<Order>) {
        let fresh: HashMap<String, Order> = orders
            .into_iter()
            .map(|order| (order.order_uid.clone(), order))
            .collect();

        let previous = std::mem::replace(&mut *self.write(), fresh);
        // Drop the old map after the lock is released
        drop(previous);
    }

    /// Snapshot of every cached order, taken under one lock acquisition.
    #[must_use]
    pub fn get_all(&self) -> Vec<Order> {
        self.read().values().cloned().collect()
    }

    /// Number of cached orders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the cache holds no orders.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A panic while holding the lock cannot leave the map half-updated:
    // every write is a single insert, remove or swap.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Order>> {
        self.orders.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Order>> {
        self.orders.write().unwrap_or_else(PoisonError::into_inner)
    }
}
