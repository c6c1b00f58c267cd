//! The order aggregate.
//!
//! An [`Order`] owns exactly one [`Delivery`], exactly one [`Payment`] and an
//! ordered list of [`Item`]s. The same JSON shape is accepted by the HTTP API
//! and carried as the ingestion stream payload.

use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::id::{OrderUidError, derive_record_id, validate_order_uid};

/// Errors that can occur when decoding an order payload.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    /// The payload is not a valid order document.
    #[error("invalid order payload: {0}")]
    Json(#[from] serde_json::Error),
    /// The payload parsed but carries an unusable identifier.
    #[error("invalid order identifier: {0}")]
    Uid(#[from] OrderUidError),
}

/// A customer order together with its owned records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Unique order identifier (primary key). Generated on create when empty.
    #[serde(default)]
    pub order_uid: String,
    pub track_number: String,
    /// Entry channel the order came through.
    pub entry: String,
    pub delivery: Delivery,
    pub payment: Payment,
    pub items: Vec<Item>,
    pub locale: String,
    #[serde(default)]
    pub internal_signature: String,
    pub customer_id: String,
    pub delivery_service: String,
    /// Shard key. Also accepted as `shard_key`.
    #[serde(default, alias = "shard_key")]
    pub shardkey: String,
    /// Numeric shard id.
    #[serde(default)]
    pub sm_id: i32,
    /// Creation time. Stored with microsecond precision.
    pub date_created: DateTime<Utc>,
    /// Shard suffix.
    #[serde(default)]
    pub oof_shard: String,
}

/// Recipient and shipping address of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Stored record id; derived from the order identifier on insert.
    #[serde(default)]
    pub delivery_id: String,
    /// Owning order identifier.
    #[serde(default)]
    pub order_uid: String,
    pub name: String,
    pub phone: String,
    pub zip: String,
    pub city: String,
    pub address: String,
    pub region: String,
    pub email: String,
}

/// Payment details of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Stored record id; derived from the order identifier on insert.
    #[serde(default)]
    pub payment_id: String,
    /// Owning order identifier.
    #[serde(default)]
    pub order_uid: String,
    pub transaction: String,
    #[serde(default)]
    pub request_id: String,
    pub currency: String,
    pub provider: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    /// Payment time as a Unix timestamp.
    pub payment_dt: i64,
    pub bank: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub delivery_cost: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub goods_total: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub custom_fee: Decimal,
}

/// A single line item of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Stored record id; derived from the order identifier on insert.
    #[serde(default)]
    pub item_id: String,
    /// Owning order identifier.
    #[serde(default)]
    pub order_uid: String,
    pub chrt_id: i64,
    pub track_number: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub rid: String,
    pub name: String,
    /// Sale percentage.
    #[serde(with = "rust_decimal::serde::float")]
    pub sale: Decimal,
    pub size: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_price: Decimal,
    pub nm_id: i64,
    pub brand: String,
    /// Item status code.
    pub status: i32,
}

impl Order {
    /// Decode an order from a JSON payload and validate its identifier.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::Json` if the payload is not a valid order
    /// document, or `DecodeError::Uid` if the identifier is unusable.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let order: Self = serde_json::from_slice(payload)?;
        validate_order_uid(&order.order_uid)?;
        Ok(order)
    }

    /// Bring the order into the exact shape it has once stored.
    ///
    /// Derives record ids (see [`Order::assign_record_ids`]) and reduces
    /// `date_created` to the precision of the store, so the returned order
    /// equals what a later read yields.
    pub fn prepare_for_storage(&mut self) {
        self.assign_record_ids();
        self.date_created = to_storage_precision(self.date_created);
    }

    /// Bind every owned record to this order and derive their stored ids.
    ///
    /// Record ids become `<natural-id>_<order_uid>`. Missing natural ids fall
    /// back to `delivery`, the payment transaction (or `payment`), and the
    /// item's position in the list. An item id already taken by an earlier
    /// item of the same order is prefixed with the item's position until it
    /// is unique.
    pub fn assign_record_ids(&mut self) {
        let uid = self.order_uid.as_str();

        self.delivery.order_uid = uid.to_owned();
        self.delivery.delivery_id = derive_record_id(&self.delivery.delivery_id, "delivery", uid);

        let payment_fallback = if self.payment.transaction.is_empty() {
            "payment"
        } else {
            self.payment.transaction.as_str()
        };
        self.payment.payment_id = derive_record_id(&self.payment.payment_id, payment_fallback, uid);
        self.payment.order_uid = uid.to_owned();

        let mut taken = HashSet::with_capacity(self.items.len());
        for (position, item) in self.items.iter_mut().enumerate() {
            item.order_uid = uid.to_owned();
            let mut id = derive_record_id(&item.item_id, &position.to_string(), uid);
            while !taken.insert(id.clone()) {
                id = format!("{position}_{id}");
            }
            item.item_id = id;
        }
    }
}

/// Unix time of 2000-01-01, the origin `PostgreSQL` timestamps count from.
const STORAGE_EPOCH_SECS: i64 = 946_684_800;

/// Drop sub-microsecond digits the way the store does: toward 2000-01-01.
fn to_storage_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    let excess = i64::from(ts.timestamp_subsec_nanos() % 1_000);
    if excess == 0 {
        return ts;
    }

    let truncated = ts - TimeDelta::nanoseconds(excess);
    if ts.timestamp() >= STORAGE_EPOCH_SECS {
        truncated
    } else {
        truncated + TimeDelta::microseconds(1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "order_uid": "b563feb7b2b84b6test",
        "track_number": "WBILMTESTTRACK",
        "entry": "WBIL",
        "delivery": {
            "name": "Test Testov",
            "phone": "+9720000000",
            "zip": "2639809",
            "city": "Kiryat Mozkin",
            "address": "Ploshad Mira 15",
            "region": "Kraiot",
            "email": "test@gmail.com"
        },
        "payment": {
            "transaction": "b563feb7b2b84b6test",
            "request_id": "",
            "currency": "USD",
            "provider": "wbpay",
            "amount": 1817,
            "payment_dt": 1637907727,
            "bank": "alpha",
            "delivery_cost": 1500,
            "goods_total": 317,
            "custom_fee": 0
        },
        "items": [
            {
                "chrt_id": 9934930,
                "track_number": "WBILMTESTTRACK",
                "price": 453,
                "rid": "ab4219087a764ae0btest",
                "name": "Mascaras",
                "sale": 30,
                "size": "0",
                "total_price": 317,
                "nm_id": 2389212,
                "brand": "Vivienne Sabo",
                "status": 202
            }
        ],
        "locale": "en",
        "internal_signature": "",
        "customer_id": "test",
        "delivery_service": "meest",
        "shardkey": "9",
        "sm_id": 99,
        "date_created": "2021-11-26T06:22:19Z",
        "oof_shard": "1"
    }"#;

    #[test]
    fn test_decode_sample_payload() {
        let order = Order::decode(SAMPLE.as_bytes()).unwrap();
        assert_eq!(order.order_uid, "b563feb7b2b84b6test");
        assert_eq!(order.delivery.name, "Test Testov");
        assert_eq!(order.payment.amount, Decimal::from(1817));
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].name, "Mascaras");
        assert_eq!(order.sm_id, 99);
    }

    #[test]
    fn test_decode_fractional_amount() {
        let json = SAMPLE.replace("\"amount\": 1817", "\"amount\": 1817.45");
        let order = Order::decode(json.as_bytes()).unwrap();
        assert_eq!(order.payment.amount, Decimal::new(181_745, 2));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Order::decode(b"\x00\xffnot json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        assert!(matches!(
            Order::decode(br#"{"order_uid": "x"}"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_decode_rejects_empty_uid() {
        let json = SAMPLE.replacen(
            "\"order_uid\": \"b563feb7b2b84b6test\"",
            "\"order_uid\": \"\"",
            1,
        );
        assert!(matches!(
            Order::decode(json.as_bytes()),
            Err(DecodeError::Uid(OrderUidError::Empty))
        ));
    }

    #[test]
    fn test_assign_record_ids() {
        let mut order = Order::decode(SAMPLE.as_bytes()).unwrap();
        order.assign_record_ids();

        let uid = "b563feb7b2b84b6test";
        assert_eq!(order.delivery.delivery_id, format!("delivery_{uid}"));
        assert_eq!(order.delivery.order_uid, uid);
        assert_eq!(order.payment.payment_id, format!("{uid}_{uid}"));
        assert_eq!(order.items[0].item_id, format!("0_{uid}"));
        assert_eq!(order.items[0].order_uid, uid);
    }

    #[test]
    fn test_assign_record_ids_is_idempotent() {
        let mut order = Order::decode(SAMPLE.as_bytes()).unwrap();
        order.assign_record_ids();
        let first = order.clone();
        order.assign_record_ids();
        assert_eq!(order, first);
    }

    #[test]
    fn test_assign_record_ids_never_repeats_item_ids() {
        let mut order = Order::decode(SAMPLE.as_bytes()).unwrap();
        order.items[0].item_id = "1".to_owned();
        order.items.push(order.items[0].clone());
        order.items[1].item_id = String::new();
        order.items.push(order.items[0].clone());

        order.assign_record_ids();

        let uid = "b563feb7b2b84b6test";
        let ids: Vec<&str> = order.items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                format!("1_{uid}"),
                format!("1_1_{uid}"),
                format!("2_1_{uid}"),
            ]
        );

        let first = order.clone();
        order.assign_record_ids();
        assert_eq!(order, first);
    }

    #[test]
    fn test_prepare_for_storage_keeps_microseconds() {
        let json = SAMPLE.replace("06:22:19Z", "06:22:19.123456789Z");
        let mut order = Order::decode(json.as_bytes()).unwrap();

        order.prepare_for_storage();

        assert_eq!(order.date_created.to_rfc3339(), "2021-11-26T06:22:19.123456+00:00");
        assert_eq!(order.items[0].order_uid, order.order_uid);
    }

    #[test]
    fn test_storage_precision_before_2000_rounds_toward_epoch() {
        let ts = DateTime::parse_from_rfc3339("1999-12-31T23:59:59.999998500Z")
            .unwrap()
            .with_timezone(&Utc);
        let expected = DateTime::parse_from_rfc3339("1999-12-31T23:59:59.999999Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(to_storage_precision(ts), expected);
    }

    #[test]
    fn test_decode_accepts_shard_key_and_missing_optionals() {
        let json = SAMPLE
            .replace("\"shardkey\"", "\"shard_key\"")
            .replace("\"internal_signature\": \"\",", "")
            .replace("\"request_id\": \"\",", "");

        let order = Order::decode(json.as_bytes()).unwrap();

        assert_eq!(order.shardkey, "9");
        assert!(order.internal_signature.is_empty());
        assert!(order.payment.request_id.is_empty());
        assert!(serde_json::to_value(&order).unwrap().get("shardkey").is_some());
    }

    #[test]
    fn test_json_roundtrip_keeps_numbers() {
        let order = Order::decode(SAMPLE.as_bytes()).unwrap();
        let value = serde_json::to_value(&order).unwrap();
        assert!(value["payment"]["amount"].is_number());

        let back: Order = serde_json::from_value(value).unwrap();
        assert_eq!(back, order);
    }
}
