//! Integration test support for Orderflow.
//!
//! # Running Tests
//!
//! ```bash
//! # In-memory tests only
//! cargo test -p orderflow-integration-tests
//!
//! # Include the PostgreSQL-backed tests (migrations are applied automatically)
//! ORDERFLOW_TEST_DATABASE_URL=postgres://localhost/orderflow_test \
//!     cargo test -p orderflow-integration-tests
//! ```
//!
//! # Test Doubles
//!
//! - [`MemoryOrderStore`] - `OrderStore` with read counting and fault injection
//! - [`MemoryStream`] - `MessageStream` backed by a queue, recording commits and dead letters
//! - [`sample_order`] / [`sample_payload`] - Valid orders for a given identifier

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orderflow_core::{Delivery, Item, Order, Payment};
use orderflow_server::cache::OrderCache;
use orderflow_server::db::{OrderStore, PersistOutcome, RepositoryError};
use orderflow_server::service::OrderService;
use orderflow_server::stream::{MessageStream, StreamError, StreamMessage};
use rust_decimal::Decimal;
use tokio::sync::Notify;

/// Environment variable holding the database URL for `PostgreSQL` tests.
pub const TEST_DATABASE_URL_VAR: &str = "ORDERFLOW_TEST_DATABASE_URL";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Fixtures
// ============================================================================

/// A complete order with one item, keyed by `order_uid`.
#[must_use]
pub fn sample_order(order_uid: &str) -> Order {
    Order {
        order_uid: order_uid.to_owned(),
        track_number: "WBILMTESTTRACK".to_owned(),
        entry: "WBIL".to_owned(),
        delivery: Delivery {
            delivery_id: String::new(),
            order_uid: String::new(),
            name: "Test Testov".to_owned(),
            phone: "+9720000000".to_owned(),
            zip: "2639809".to_owned(),
            city: "Kiryat Mozkin".to_owned(),
            address: "Ploshad Mira 15".to_owned(),
            region: "Kraiot".to_owned(),
            email: "test@gmail.com".to_owned(),
        },
        payment: Payment {
            payment_id: String::new(),
            order_uid: String::new(),
            transaction: order_uid.to_owned(),
            request_id: String::new(),
            currency: "USD".to_owned(),
            provider: "wbpay".to_owned(),
            amount: Decimal::from(1817),
            payment_dt: 1_637_907_727,
            bank: "alpha".to_owned(),
            delivery_cost: Decimal::from(1500),
            goods_total: Decimal::from(317),
            custom_fee: Decimal::ZERO,
        },
        items: vec![Item {
            item_id: String::new(),
            order_uid: String::new(),
            chrt_id: 9_934_930,
            track_number: "WBILMTESTTRACK".to_owned(),
            price: Decimal::from(453),
            rid: "ab4219087a764ae0btest".to_owned(),
            name: "Mascaras".to_owned(),
            sale: Decimal::from(30),
            size: "0".to_owned(),
            total_price: Decimal::from(317),
            nm_id: 2_389_212,
            brand: "Vivienne Sabo".to_owned(),
            status: 202,
        }],
        locale: "en".to_owned(),
        internal_signature: String::new(),
        customer_id: "test".to_owned(),
        delivery_service: "meest".to_owned(),
        shardkey: "9".to_owned(),
        sm_id: 99,
        date_created: DateTime::<Utc>::from_timestamp(1_637_907_739, 0).unwrap_or_default(),
        oof_shard: "1".to_owned(),
    }
}

/// [`sample_order`] serialized as a stream payload.
#[must_use]
pub fn sample_payload(order_uid: &str) -> Vec<u8> {
    serde_json::to_vec(&sample_order(order_uid)).unwrap_or_default()
}

/// A service over fresh in-memory doubles.
#[must_use]
pub fn memory_service() -> (OrderService, Arc<MemoryOrderStore>) {
    let store = Arc::new(MemoryOrderStore::new());
    let service = OrderService::new(store.clone(), Arc::new(OrderCache::new()));
    (service, store)
}

// ============================================================================
// Store
// ============================================================================

/// In-memory `OrderStore` with the same write semantics as the database.
#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    orders: Mutex<BTreeMap<String, Order>>,
    reads: AtomicUsize,
    fail_writes: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

impl MemoryOrderStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get_by_id` and `get_all` calls so far.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of stored orders.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.orders).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.orders).is_empty()
    }

    /// The stored copy of an order, bypassing read counting.
    #[must_use]
    pub fn stored(&self, order_uid: &str) -> Option<Order> {
        lock(&self.orders).get(order_uid).cloned()
    }

    /// Make every subsequent write fail with a database error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent write.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *lock(&self.write_delay) = delay;
    }

    async fn before_write(&self) -> Result<(), RepositoryError> {
        let delay = *lock(&self.write_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn create(&self, mut order: Order) -> Result<Order, RepositoryError> {
        self.before_write().await?;
        order.prepare_for_storage();

        let mut orders = lock(&self.orders);
        if orders.contains_key(&order.order_uid) {
            return Err(RepositoryError::Conflict(format!(
                "order {} already exists",
                order.order_uid
            )));
        }
        orders.insert(order.order_uid.clone(), order.clone());
        Ok(order)
    }

    async fn create_order_with_associations(
        &self,
        mut order: Order,
    ) -> Result<PersistOutcome, RepositoryError> {
        self.before_write().await?;
        order.prepare_for_storage();

        let mut orders = lock(&self.orders);
        let created = !orders.contains_key(&order.order_uid);
        if created {
            orders.insert(order.order_uid.clone(), order.clone());
        }
        Ok(PersistOutcome { order, created })
    }

    async fn get_all(&self) -> Result<Vec<Order>, RepositoryError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.orders).values().cloned().collect())
    }

    async fn get_by_id(&self, order_uid: &str) -> Result<Order, RepositoryError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        lock(&self.orders)
            .get(order_uid)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn delete(&self, order_uid: &str) -> Result<(), RepositoryError> {
        self.before_write().await?;
        lock(&self.orders).remove(order_uid);
        Ok(())
    }
}

// ============================================================================
// Stream
// ============================================================================

/// In-memory `MessageStream`.
///
/// `fetch` waits until a message is pushed or the stream is closed.
#[derive(Debug, Default)]
pub struct MemoryStream {
    pending: Mutex<VecDeque<StreamMessage>>,
    next_offset: AtomicUsize,
    committed: Mutex<Vec<i64>>,
    dead_letters: Mutex<Vec<(i64, String)>>,
    closed: AtomicBool,
    notify: Notify,
}

impl MemoryStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return its offset.
    pub fn push(&self, key: Option<&str>, payload: impl Into<Vec<u8>>) -> i64 {
        let offset = i64::try_from(self.next_offset.fetch_add(1, Ordering::SeqCst) + 1)
            .unwrap_or(i64::MAX);
        lock(&self.pending).push_back(StreamMessage {
            offset,
            key: key.map(str::to_owned),
            payload: payload.into(),
            published_at: Utc::now(),
        });
        self.notify.notify_one();
        offset
    }

    /// Append a valid order message.
    pub fn push_order(&self, order_uid: &str) -> i64 {
        self.push(Some(order_uid), sample_payload(order_uid))
    }

    /// Deliver `Closed` once the queue is drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Offsets committed so far, in commit order.
    #[must_use]
    pub fn committed(&self) -> Vec<i64> {
        lock(&self.committed).clone()
    }

    /// Dead-lettered offsets with their reasons.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<(i64, String)> {
        lock(&self.dead_letters).clone()
    }

    /// Messages not fetched yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }
}

#[async_trait]
impl MessageStream for MemoryStream {
    async fn fetch(&self) -> Result<StreamMessage, StreamError> {
        loop {
            let next = lock(&self.pending).pop_front();
            if let Some(message) = next {
                return Ok(message);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(StreamError::Closed);
            }
            self.notify.notified().await;
        }
    }

    async fn commit(&self, message: &StreamMessage) -> Result<(), StreamError> {
        lock(&self.committed).push(message.offset);
        Ok(())
    }

    async fn dead_letter(&self, message: &StreamMessage, reason: &str) -> Result<(), StreamError> {
        lock(&self.dead_letters).push((message.offset, reason.to_owned()));
        Ok(())
    }
}
