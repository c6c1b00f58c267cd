//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;

use crate::service::OrderService;

/// Application state shared across all handlers.
///
/// Cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    service: OrderService,
    pool: Option<PgPool>,
}

impl AppState {
    /// Create state backed by a `PostgreSQL` pool.
    #[must_use]
    pub fn new(service: OrderService, pool: PgPool) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                service,
                pool: Some(pool),
            }),
        }
    }

    /// Create state without a database pool. Readiness always reports OK.
    #[must_use]
    pub fn without_database(service: OrderService) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                service,
                pool: None,
            }),
        }
    }

    /// Get a reference to the order service.
    #[must_use]
    pub fn service(&self) -> &OrderService {
        &self.inner.service
    }

    /// Get a reference to the database connection pool, if any.
    #[must_use]
    pub fn pool(&self) -> Option<&PgPool> {
        self.inner.pool.as_ref()
    }
}
