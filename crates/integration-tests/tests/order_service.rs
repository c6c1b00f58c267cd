//! Read-through/write-through behaviour of the order service over in-memory doubles.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use chrono::{DateTime, Utc};
use orderflow_integration_tests::{memory_service, sample_order};
use orderflow_server::db::OrderStore;
use orderflow_server::service::ServiceError;
use rust_decimal::Decimal;

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn test_create_then_get_is_served_from_cache() {
    let (service, store) = memory_service();

    let created = service.create(sample_order("order-1")).await.unwrap();
    assert_eq!(created.delivery.delivery_id, "delivery_order-1");
    assert_eq!(created.items[0].item_id, "0_order-1");

    let fetched = service.get_by_id("order-1").await.unwrap();
    assert_eq!(fetched, created);
    assert_eq!(store.reads(), 0, "cached order must not hit the store");
}

#[tokio::test]
async fn test_create_generates_missing_identifier() {
    let (service, store) = memory_service();

    let created = service.create(sample_order("")).await.unwrap();

    assert_eq!(created.order_uid.len(), 32);
    assert!(created.order_uid.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(store.stored(&created.order_uid).is_some());
    assert!(service.cache().get(&created.order_uid).is_some());
}

#[tokio::test]
async fn test_create_rejects_unusable_identifier() {
    let (service, store) = memory_service();

    let err = service
        .create(sample_order(&"x".repeat(500)))
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Invalid(_)));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_create_duplicate_conflicts_and_keeps_cache() {
    let (service, store) = memory_service();
    service.create(sample_order("dup")).await.unwrap();

    let mut second = sample_order("dup");
    second.track_number = "OTHER".to_owned();
    let err = service.create(second).await.unwrap_err();

    assert!(matches!(err, ServiceError::Conflict(_)));
    assert_eq!(store.len(), 1);
    assert_eq!(
        service.cache().get("dup").unwrap().track_number,
        "WBILMTESTTRACK"
    );
}

#[tokio::test]
async fn test_failed_write_leaves_cache_untouched() {
    let (service, store) = memory_service();
    store.fail_writes(true);

    let err = service.create(sample_order("broken")).await.unwrap_err();

    assert!(matches!(err, ServiceError::Repository(_)));
    assert!(service.cache().is_empty());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_ingest_is_idempotent() {
    let (service, store) = memory_service();

    let first = service.ingest(sample_order("again")).await.unwrap();
    let second = service.ingest(sample_order("again")).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(store.len(), 1);
    assert_eq!(store.stored("again").unwrap().items.len(), 1);
    assert_eq!(service.cache().len(), 1);
}

#[tokio::test]
async fn test_order123_round_trip() {
    let (service, _store) = memory_service();

    let mut order = sample_order("order123");
    order.items[0].price = Decimal::from(500);
    order.payment.amount = Decimal::from(1000);
    let created = service.create(order.clone()).await.unwrap();
    service.cache().delete("order123");

    let fetched = service.get_by_id("order123").await.unwrap();
    assert_eq!(fetched, created);
    assert_eq!(fetched.delivery.name, order.delivery.name);
    assert_eq!(fetched.payment.transaction, order.payment.transaction);
    assert_eq!(fetched.items[0].name, order.items[0].name);
    assert_eq!(fetched.items[0].price, Decimal::from(500));
    assert_eq!(fetched.payment.amount, Decimal::from(1000));
}

#[tokio::test]
async fn test_cached_order_matches_stored_precision() {
    let (service, store) = memory_service();

    let mut order = sample_order("nanos");
    order.date_created = DateTime::parse_from_rfc3339("2021-11-26T06:22:19.123456789Z")
        .unwrap()
        .with_timezone(&Utc);
    let outcome = service.ingest(order).await.unwrap();

    let cached = service.cache().get("nanos").unwrap();
    assert_eq!(cached, outcome.order);
    assert_eq!(cached, store.stored("nanos").unwrap());
    assert_eq!(cached.date_created.timestamp_subsec_nanos(), 123_456_000);
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn test_cache_miss_reads_store_once() {
    let (service, store) = memory_service();
    store.create(sample_order("cold")).await.unwrap();
    assert!(service.cache().get("cold").is_none());

    let first = service.get_by_id("cold").await.unwrap();
    let second = service.get_by_id("cold").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(store.reads(), 1);
    assert!(service.cache().get("cold").is_some());
}

#[tokio::test]
async fn test_missing_order_is_not_cached() {
    let (service, store) = memory_service();

    for _ in 0..2 {
        let err = service.get_by_id("ghost").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(ref uid) if uid == "ghost"));
    }

    assert_eq!(store.reads(), 2);
    assert!(service.cache().is_empty());
}

#[tokio::test]
async fn test_get_all_always_reads_store() {
    let (service, store) = memory_service();
    service.create(sample_order("a")).await.unwrap();
    service.create(sample_order("b")).await.unwrap();

    assert_eq!(service.get_all().await.unwrap().len(), 2);
    assert_eq!(service.get_all().await.unwrap().len(), 2);
    assert_eq!(store.reads(), 2);
}

#[tokio::test]
async fn test_warm_cache_loads_every_order() {
    let (service, store) = memory_service();
    for uid in ["w1", "w2", "w3"] {
        store.create(sample_order(uid)).await.unwrap();
    }

    let warmed = service.warm_cache().await.unwrap();

    assert_eq!(warmed, 3);
    service.get_by_id("w2").await.unwrap();
    assert_eq!(store.reads(), 1, "only the warm-up should read the store");
}

// ============================================================================
// Deletes
// ============================================================================

#[tokio::test]
async fn test_delete_removes_from_store_and_cache() {
    let (service, store) = memory_service();
    service.create(sample_order("gone")).await.unwrap();

    service.delete("gone").await.unwrap();

    assert!(store.is_empty());
    assert!(service.cache().get("gone").is_none());
    assert!(matches!(
        service.get_by_id("gone").await.unwrap_err(),
        ServiceError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_delete_missing_order_succeeds() {
    let (service, _store) = memory_service();
    service.delete("never-existed").await.unwrap();
}

#[tokio::test]
async fn test_failed_delete_keeps_cache_entry() {
    let (service, store) = memory_service();
    service.create(sample_order("sticky")).await.unwrap();
    store.fail_writes(true);

    assert!(service.delete("sticky").await.is_err());
    assert!(service.cache().get("sticky").is_some());
    assert!(store.stored("sticky").is_some());
}
