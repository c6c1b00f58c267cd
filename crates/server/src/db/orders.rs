//! `PostgreSQL` order store.
//!
//! Writes go through a single transaction covering the order row and all of
//! its owned rows. Idempotency rests on the `orders` primary key alone: the
//! order row is inserted with `ON CONFLICT DO NOTHING` and an unchanged row
//! count ends the transaction as a no-op.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orderflow_core::{Delivery, Item, Order, Payment};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, instrument};

use super::{OrderStore, PersistOutcome, RepositoryError, map_record_collision};

const ORDER_COLUMNS: &str = "order_uid, track_number, entry, locale, internal_signature, \
     customer_id, delivery_service, shardkey, sm_id, date_created, oof_shard";

const DELIVERY_COLUMNS: &str =
    "delivery_id, order_uid, name, phone, zip, city, address, region, email";

const PAYMENT_COLUMNS: &str = r#"payment_id, order_uid, "transaction", request_id, currency, provider, amount, payment_dt, bank, delivery_cost, goods_total, custom_fee"#;

const ITEM_COLUMNS: &str = "item_id, order_uid, chrt_id, track_number, price, rid, name, sale, \
     size, total_price, nm_id, brand, status";

/// Repository for orders and their owned records.
#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    /// Create a new order store.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a read-only transaction that sees a single snapshot.
    async fn begin_snapshot(&self) -> Result<Transaction<'static, Postgres>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    #[instrument(skip(self, order), fields(order_uid = %order.order_uid))]
    async fn create(&self, mut order: Order) -> Result<Order, RepositoryError> {
        order.prepare_for_storage();

        let mut tx = self.pool.begin().await?;
        if !insert_order_row(&mut tx, &order).await? {
            tx.rollback().await?;
            return Err(RepositoryError::Conflict(format!(
                "order {} already exists",
                order.order_uid
            )));
        }
        insert_owned_rows(&mut tx, &order).await?;
        tx.commit().await?;

        debug!(items = order.items.len(), "Order created");
        Ok(order)
    }

    #[instrument(skip(self, order), fields(order_uid = %order.order_uid))]
    async fn create_order_with_associations(
        &self,
        mut order: Order,
    ) -> Result<PersistOutcome, RepositoryError> {
        order.prepare_for_storage();

        let mut tx = self.pool.begin().await?;
        if !insert_order_row(&mut tx, &order).await? {
            // Already stored by an earlier delivery of the same order
            tx.commit().await?;
            debug!("Order already exists, skipping insert");
            return Ok(PersistOutcome {
                order,
                created: false,
            });
        }
        insert_owned_rows(&mut tx, &order).await?;
        tx.commit().await?;

        debug!(items = order.items.len(), "Order stored");
        Ok(PersistOutcome {
            order,
            created: true,
        })
    }

    #[instrument(skip(self))]
    async fn get_all(&self) -> Result<Vec<Order>, RepositoryError> {
        let mut tx = self.begin_snapshot().await?;

        let orders = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders ORDER BY date_created, order_uid"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let deliveries = sqlx::query_as::<_, DeliveryRow>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let payments =
            sqlx::query_as::<_, PaymentRow>(&format!("SELECT {PAYMENT_COLUMNS} FROM payments"))
                .fetch_all(&mut *tx)
                .await?;
        let items = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items ORDER BY order_uid, line_no"
        ))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let orders = assemble(orders, deliveries, payments, items)?;
        debug!(count = orders.len(), "Loaded all orders");
        Ok(orders)
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, order_uid: &str) -> Result<Order, RepositoryError> {
        let mut tx = self.begin_snapshot().await?;

        let Some(order) = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_uid = $1"
        ))
        .bind(order_uid)
        .fetch_optional(&mut *tx)
        .await?
        else {
            tx.commit().await?;
            return Err(RepositoryError::NotFound);
        };

        let deliveries = sqlx::query_as::<_, DeliveryRow>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE order_uid = $1"
        ))
        .bind(order_uid)
        .fetch_all(&mut *tx)
        .await?;
        let payments = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_uid = $1"
        ))
        .bind(order_uid)
        .fetch_all(&mut *tx)
        .await?;
        let items = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE order_uid = $1 ORDER BY line_no"
        ))
        .bind(order_uid)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        assemble(vec![order], deliveries, payments, items)?
            .pop()
            .ok_or(RepositoryError::NotFound)
    }

    #[instrument(skip(self))]
    async fn delete(&self, order_uid: &str) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // Children first; the foreign keys cascade as well
        for table in ["items", "payments", "deliveries", "orders"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE order_uid = $1"))
                .bind(order_uid)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!("Order deleted");
        Ok(())
    }
}

// =============================================================================
// Writes
// =============================================================================

/// Insert the order row. Returns `false` if the identifier already exists.
async fn insert_order_row(
    tx: &mut Transaction<'_, Postgres>,
    order: &Order,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(&format!(
        "INSERT INTO orders ({ORDER_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (order_uid) DO NOTHING"
    ))
    .bind(&order.order_uid)
    .bind(&order.track_number)
    .bind(&order.entry)
    .bind(&order.locale)
    .bind(&order.internal_signature)
    .bind(&order.customer_id)
    .bind(&order.delivery_service)
    .bind(&order.shardkey)
    .bind(order.sm_id)
    .bind(order.date_created)
    .bind(&order.oof_shard)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Insert delivery, payment and items of an order whose row was just inserted.
async fn insert_owned_rows(
    tx: &mut Transaction<'_, Postgres>,
    order: &Order,
) -> Result<(), RepositoryError> {
    let d = &order.delivery;
    sqlx::query(&format!(
        "INSERT INTO deliveries ({DELIVERY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
    ))
    .bind(&d.delivery_id)
    .bind(&order.order_uid)
    .bind(&d.name)
    .bind(&d.phone)
    .bind(&d.zip)
    .bind(&d.city)
    .bind(&d.address)
    .bind(&d.region)
    .bind(&d.email)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_record_collision(e, "delivery record"))?;

    let p = &order.payment;
    sqlx::query(&format!(
        "INSERT INTO payments ({PAYMENT_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
    ))
    .bind(&p.payment_id)
    .bind(&order.order_uid)
    .bind(&p.transaction)
    .bind(&p.request_id)
    .bind(&p.currency)
    .bind(&p.provider)
    .bind(p.amount)
    .bind(p.payment_dt)
    .bind(&p.bank)
    .bind(p.delivery_cost)
    .bind(p.goods_total)
    .bind(p.custom_fee)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_record_collision(e, "payment record"))?;

    if order.items.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<'_, Postgres> =
        QueryBuilder::new(format!("INSERT INTO items (line_no, {ITEM_COLUMNS}) "));
    builder.push_values(order.items.iter().zip(0_i32..), |mut row, (item, line_no)| {
        row.push_bind(line_no)
            .push_bind(&item.item_id)
            .push_bind(&order.order_uid)
            .push_bind(item.chrt_id)
            .push_bind(&item.track_number)
            .push_bind(item.price)
            .push_bind(&item.rid)
            .push_bind(&item.name)
            .push_bind(item.sale)
            .push_bind(&item.size)
            .push_bind(item.total_price)
            .push_bind(item.nm_id)
            .push_bind(&item.brand)
            .push_bind(item.status);
    });
    builder
        .build()
        .execute(&mut **tx)
        .await
        .map_err(|e| map_record_collision(e, "item record"))?;

    Ok(())
}

// =============================================================================
// Reads
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    order_uid: String,
    track_number: String,
    entry: String,
    locale: String,
    internal_signature: String,
    customer_id: String,
    delivery_service: String,
    shardkey: String,
    sm_id: i32,
    date_created: DateTime<Utc>,
    oof_shard: String,
}

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    delivery_id: String,
    order_uid: String,
    name: String,
    phone: String,
    zip: String,
    city: String,
    address: String,
    region: String,
    email: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    payment_id: String,
    order_uid: String,
    transaction: String,
    request_id: String,
    currency: String,
    provider: String,
    amount: Decimal,
    payment_dt: i64,
    bank: String,
    delivery_cost: Decimal,
    goods_total: Decimal,
    custom_fee: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    item_id: String,
    order_uid: String,
    chrt_id: i64,
    track_number: String,
    price: Decimal,
    rid: String,
    name: String,
    sale: Decimal,
    size: String,
    total_price: Decimal,
    nm_id: i64,
    brand: String,
    status: i32,
}

impl From<DeliveryRow> for Delivery {
    fn from(r: DeliveryRow) -> Self {
        Self {
            delivery_id: r.delivery_id,
            order_uid: r.order_uid,
            name: r.name,
            phone: r.phone,
            zip: r.zip,
            city: r.city,
            address: r.address,
            region: r.region,
            email: r.email,
        }
    }
}

impl From<PaymentRow> for Payment {
    fn from(r: PaymentRow) -> Self {
        Self {
            payment_id: r.payment_id,
            order_uid: r.order_uid,
            transaction: r.transaction,
            request_id: r.request_id,
            currency: r.currency,
            provider: r.provider,
            amount: r.amount,
            payment_dt: r.payment_dt,
            bank: r.bank,
            delivery_cost: r.delivery_cost,
            goods_total: r.goods_total,
            custom_fee: r.custom_fee,
        }
    }
}

impl From<ItemRow> for Item {
    fn from(r: ItemRow) -> Self {
        Self {
            item_id: r.item_id,
            order_uid: r.order_uid,
            chrt_id: r.chrt_id,
            track_number: r.track_number,
            price: r.price,
            rid: r.rid,
            name: r.name,
            sale: r.sale,
            size: r.size,
            total_price: r.total_price,
            nm_id: r.nm_id,
            brand: r.brand,
            status: r.status,
        }
    }
}

/// Join order rows with their owned rows.
///
/// Items must arrive in line order. An order without a delivery or payment
/// row is reported as corruption; the write path never produces one.
fn assemble(
    orders: Vec<OrderRow>,
    deliveries: Vec<DeliveryRow>,
    payments: Vec<PaymentRow>,
    items: Vec<ItemRow>,
) -> Result<Vec<Order>, RepositoryError> {
    let mut deliveries: HashMap<String, DeliveryRow> = deliveries
        .into_iter()
        .map(|d| (d.order_uid.clone(), d))
        .collect();
    let mut payments: HashMap<String, PaymentRow> = payments
        .into_iter()
        .map(|p| (p.order_uid.clone(), p))
        .collect();
    let mut items_by_order: HashMap<String, Vec<Item>> = HashMap::new();
    for item in items {
        items_by_order
            .entry(item.order_uid.clone())
            .or_default()
            .push(item.into());
    }

    orders
        .into_iter()
        .map(|o| {
            let delivery = deliveries.remove(&o.order_uid).ok_or_else(|| {
                RepositoryError::DataCorruption(format!("order {} has no delivery", o.order_uid))
            })?;
            let payment = payments.remove(&o.order_uid).ok_or_else(|| {
                RepositoryError::DataCorruption(format!("order {} has no payment", o.order_uid))
            })?;
            let items = items_by_order.remove(&o.order_uid).unwrap_or_default();

            Ok(Order {
                order_uid: o.order_uid,
                track_number: o.track_number,
                entry: o.entry,
                delivery: delivery.into(),
                payment: payment.into(),
                items,
                locale: o.locale,
                internal_signature: o.internal_signature,
                customer_id: o.customer_id,
                delivery_service: o.delivery_service,
                shardkey: o.shardkey,
                sm_id: o.sm_id,
                date_created: o.date_created,
                oof_shard: o.oof_shard,
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn order_row(uid: &str) -> OrderRow {
        OrderRow {
            order_uid: uid.to_owned(),
            track_number: "TRACK".to_owned(),
            entry: "WBIL".to_owned(),
            locale: "en".to_owned(),
            internal_signature: String::new(),
            customer_id: "c1".to_owned(),
            delivery_service: "meest".to_owned(),
            shardkey: "9".to_owned(),
            sm_id: 99,
            date_created: DateTime::from_timestamp(1_637_907_739, 0).unwrap(),
            oof_shard: "1".to_owned(),
        }
    }

    fn delivery_row(uid: &str) -> DeliveryRow {
        DeliveryRow {
            delivery_id: format!("delivery_{uid}"),
            order_uid: uid.to_owned(),
            name: format!("Recipient {uid}"),
            phone: "+100".to_owned(),
            zip: "1".to_owned(),
            city: "City".to_owned(),
            address: "Street 1".to_owned(),
            region: "Region".to_owned(),
            email: "r@example.com".to_owned(),
        }
    }

    fn payment_row(uid: &str) -> PaymentRow {
        PaymentRow {
            payment_id: format!("tx_{uid}"),
            order_uid: uid.to_owned(),
            transaction: "tx".to_owned(),
            request_id: String::new(),
            currency: "USD".to_owned(),
            provider: "wbpay".to_owned(),
            amount: Decimal::from(1000),
            payment_dt: 1_637_907_727,
            bank: "alpha".to_owned(),
            delivery_cost: Decimal::from(500),
            goods_total: Decimal::from(500),
            custom_fee: Decimal::ZERO,
        }
    }

    fn item_row(uid: &str, name: &str) -> ItemRow {
        ItemRow {
            item_id: format!("{name}_{uid}"),
            order_uid: uid.to_owned(),
            chrt_id: 1,
            track_number: "TRACK".to_owned(),
            price: Decimal::from(500),
            rid: "rid".to_owned(),
            name: name.to_owned(),
            sale: Decimal::ZERO,
            size: "0".to_owned(),
            total_price: Decimal::from(500),
            nm_id: 2,
            brand: "Brand".to_owned(),
            status: 202,
        }
    }

    #[test]
    fn test_assemble_joins_owned_rows() {
        let orders = assemble(
            vec![order_row("a"), order_row("b")],
            vec![delivery_row("b"), delivery_row("a")],
            vec![payment_row("a"), payment_row("b")],
            vec![item_row("a", "first"), item_row("a", "second"), item_row("b", "only")],
        )
        .unwrap();

        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].order_uid, "a");
        assert_eq!(orders[0].delivery.name, "Recipient a");
        assert_eq!(orders[0].items.len(), 2);
        assert_eq!(orders[0].items[0].name, "first");
        assert_eq!(orders[0].items[1].name, "second");
        assert_eq!(orders[1].items.len(), 1);
        assert_eq!(orders[1].payment.order_uid, "b");
    }

    #[test]
    fn test_assemble_order_without_items() {
        let orders = assemble(
            vec![order_row("a")],
            vec![delivery_row("a")],
            vec![payment_row("a")],
            vec![],
        )
        .unwrap();
        assert!(orders[0].items.is_empty());
    }

    #[test]
    fn test_assemble_missing_delivery_is_corruption() {
        let result = assemble(vec![order_row("a")], vec![], vec![payment_row("a")], vec![]);
        assert!(matches!(result, Err(RepositoryError::DataCorruption(_))));
    }

    #[test]
    fn test_assemble_missing_payment_is_corruption() {
        let result = assemble(vec![order_row("a")], vec![delivery_row("a")], vec![], vec![]);
        assert!(matches!(result, Err(RepositoryError::DataCorruption(_))));
    }
}
