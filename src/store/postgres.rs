//! PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use super::{cart_matches, CartRepository, Catalog, NewOrder, NewOrderItem, OrderFilter, OrderRepository, Page};
use crate::domain::aggregates::{CartItem, CartLine, Order, OrderDetails, OrderItem, Product, ShippingAddress};
use crate::domain::value_objects::{CartItemId, CustomerId, IdempotencyKey, Money, OrderId, OrderNumber, ProductId, VendorId};
use crate::{CommerceError, Result};

const PRODUCT_COLUMNS: &str = "id, vendor_id, name, image_url, price, stock_count, in_stock";
const ORDER_COLUMNS: &str = "id, order_number, customer_id, status, subtotal, shipping_cost, total_amount, carrier, \
     shipping_address, payment_method, idempotency_key, created_at, updated_at";

const UPSERT_CART_ITEM_SQL: &str = "INSERT INTO cart_items (id, customer_id, product_id, quantity, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, NOW(), NOW()) \
     ON CONFLICT (customer_id, product_id) DO UPDATE SET quantity = cart_items.quantity + EXCLUDED.quantity, updated_at = NOW() \
     RETURNING *";
const LIST_CART_SQL: &str = "SELECT ci.id, ci.product_id, ci.quantity, p.name, p.image_url, p.price, p.stock_count, p.in_stock, p.vendor_id \
     FROM cart_items ci JOIN products p ON p.id = ci.product_id \
     WHERE ci.customer_id = $1 ORDER BY ci.created_at, ci.id";

const SET_TX_TIMEOUT_SQL: &str = "SELECT set_config('statement_timeout', $1, true)";
const NEXT_ORDER_SEQ_SQL: &str = "SELECT nextval('order_number_seq')";
const INSERT_ORDER_SQL: &str = "INSERT INTO orders (id, order_number, customer_id, status, subtotal, shipping_cost, total_amount, \
     carrier, shipping_address, payment_method, idempotency_key, created_at, updated_at) \
     VALUES ($1, $2, $3, 'PENDING', $4, $5, $6, $7, $8, $9, $10, NOW(), NOW()) RETURNING *";
// Right-hand side expressions see the pre-update row, so both columns move together.
const DECREMENT_STOCK_SQL: &str = "UPDATE products \
     SET stock_count = stock_count - $2, in_stock = (stock_count - $2) > 0, updated_at = NOW() \
     WHERE id = $1 AND stock_count >= $2 RETURNING stock_count";
const LOCK_CART_SQL: &str = "SELECT product_id, quantity FROM cart_items WHERE customer_id = $1 FOR UPDATE";
const INSERT_ORDER_ITEM_SQL: &str = "INSERT INTO order_items (id, order_id, product_id, vendor_id, quantity, unit_price) \
     VALUES ($1, $2, $3, $4, $5, $6) RETURNING *";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    tx_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, tx_timeout: Duration) -> Self { Self { pool, tx_timeout } }

    pub async fn connect(url: &str, max_connections: u32, acquire_timeout: Duration, tx_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(max_connections).acquire_timeout(acquire_timeout).connect(url).await?;
        Ok(Self::new(pool, tx_timeout))
    }

    pub async fn migrate(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool { &self.pool }

    async fn load_items(&self, order: Order) -> Result<OrderDetails> {
        let records = sqlx::query_as::<_, OrderItemRecord>("SELECT * FROM order_items WHERE order_id = $1 ORDER BY product_id")
            .bind(order.id)
            .fetch_all(&self.pool)
            .await?;
        let items = records.into_iter().map(OrderItem::try_from).collect::<Result<Vec<_>>>()?;
        Ok(OrderDetails { order, items })
    }

    async fn fetch_page(&self, where_sql: &str, owner: Uuid, filter: &OrderFilter) -> Result<Page<Order>> {
        let status = filter.status.map(|s| s.as_str());
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders o WHERE {where_sql} AND ($2::text IS NULL OR o.status = $2) \
             ORDER BY o.created_at DESC, o.id DESC LIMIT $3 OFFSET $4"
        );
        let records = sqlx::query_as::<_, OrderRecord>(&sql)
            .bind(owner)
            .bind(status)
            .bind(i64::from(filter.per_page()))
            .bind(i64::try_from(filter.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        let count_sql = format!("SELECT COUNT(*) FROM orders o WHERE {where_sql} AND ($2::text IS NULL OR o.status = $2)");
        let total: i64 = sqlx::query_scalar(&count_sql).bind(owner).bind(status).fetch_one(&self.pool).await?;
        let data = records.into_iter().map(Order::try_from).collect::<Result<Vec<_>>>()?;
        Ok(Page { data, total, page: filter.page(), per_page: filter.per_page() })
    }

    async fn decrement_and_record(tx: &mut Transaction<'_, Postgres>, order_id: OrderId, line: &NewOrderItem) -> Result<OrderItem> {
        let quantity = to_db_quantity(line.quantity)?;
        let remaining: Option<i32> = sqlx::query_scalar(DECREMENT_STOCK_SQL)
            .bind(line.product_id)
            .bind(quantity)
            .fetch_optional(&mut **tx)
            .await?;
        if remaining.is_none() {
            let available: Option<i32> = sqlx::query_scalar("SELECT stock_count FROM products WHERE id = $1")
                .bind(line.product_id)
                .fetch_optional(&mut **tx)
                .await?;
            return Err(match available {
                None => CommerceError::ProductNotFound(line.product_id),
                Some(available) => CommerceError::InsufficientStock {
                    product_id: line.product_id,
                    requested: line.quantity,
                    available: u32::try_from(available).unwrap_or(0),
                },
            });
        }
        let record = sqlx::query_as::<_, OrderItemRecord>(INSERT_ORDER_ITEM_SQL)
            .bind(Uuid::now_v7())
            .bind(order_id)
            .bind(line.product_id)
            .bind(line.vendor_id)
            .bind(quantity)
            .bind(line.unit_price)
            .fetch_one(&mut **tx)
            .await?;
        OrderItem::try_from(record)
    }
}

#[async_trait]
impl Catalog for PgStore {
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1");
        Ok(sqlx::query_as::<_, Product>(&sql).bind(id).fetch_optional(&self.pool).await?)
    }

    async fn get_products(&self, ids: &[ProductId]) -> Result<Vec<Product>> {
        let ids: Vec<Uuid> = ids.iter().map(|id| id.into_uuid()).collect();
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ANY($1)");
        Ok(sqlx::query_as::<_, Product>(&sql).bind(ids).fetch_all(&self.pool).await?)
    }
}

#[async_trait]
impl CartRepository for PgStore {
    async fn find_by_product(&self, customer: CustomerId, product: ProductId) -> Result<Option<CartItem>> {
        sqlx::query_as::<_, CartItemRecord>("SELECT * FROM cart_items WHERE customer_id = $1 AND product_id = $2")
            .bind(customer)
            .bind(product)
            .fetch_optional(&self.pool)
            .await?
            .map(CartItem::try_from)
            .transpose()
    }

    async fn get_item(&self, customer: CustomerId, item: CartItemId) -> Result<Option<CartItem>> {
        sqlx::query_as::<_, CartItemRecord>("SELECT * FROM cart_items WHERE customer_id = $1 AND id = $2")
            .bind(customer)
            .bind(item)
            .fetch_optional(&self.pool)
            .await?
            .map(CartItem::try_from)
            .transpose()
    }

    async fn upsert_add(&self, customer: CustomerId, product: ProductId, quantity: u32) -> Result<CartItem> {
        let record = sqlx::query_as::<_, CartItemRecord>(UPSERT_CART_ITEM_SQL)
            .bind(CartItemId::new())
            .bind(customer)
            .bind(product)
            .bind(to_db_quantity(quantity)?)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                let missing_product = matches!(&e, sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::ForeignKeyViolation));
                if missing_product { CommerceError::ProductNotFound(product) } else { CommerceError::from(e) }
            })?;
        CartItem::try_from(record)
    }

    async fn set_quantity(&self, customer: CustomerId, item: CartItemId, quantity: u32) -> Result<Option<CartItem>> {
        sqlx::query_as::<_, CartItemRecord>(
            "UPDATE cart_items SET quantity = $3, updated_at = NOW() WHERE customer_id = $1 AND id = $2 RETURNING *",
        )
        .bind(customer)
        .bind(item)
        .bind(to_db_quantity(quantity)?)
        .fetch_optional(&self.pool)
        .await?
        .map(CartItem::try_from)
        .transpose()
    }

    async fn remove(&self, customer: CustomerId, item: CartItemId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cart_items WHERE customer_id = $1 AND id = $2")
            .bind(customer)
            .bind(item)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self, customer: CustomerId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cart_items WHERE customer_id = $1").bind(customer).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn list(&self, customer: CustomerId) -> Result<Vec<CartLine>> {
        let records = sqlx::query_as::<_, CartLineRecord>(LIST_CART_SQL).bind(customer).fetch_all(&self.pool).await?;
        records.into_iter().map(CartLine::try_from).collect()
    }
}

#[async_trait]
impl OrderRepository for PgStore {
    #[instrument(skip_all, fields(customer_id = %new_order.customer_id, lines = new_order.items.len()))]
    async fn commit(&self, new_order: NewOrder) -> Result<OrderDetails> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(SET_TX_TIMEOUT_SQL)
            .bind(self.tx_timeout.as_millis().to_string())
            .execute(&mut *tx)
            .await?;

        let seq: i64 = sqlx::query_scalar(NEXT_ORDER_SEQ_SQL).fetch_one(&mut *tx).await?;
        let record = sqlx::query_as::<_, OrderRecord>(INSERT_ORDER_SQL)
            .bind(OrderId::new())
            .bind(OrderNumber::from_sequence(seq).as_str())
            .bind(new_order.customer_id)
            .bind(new_order.subtotal)
            .bind(new_order.shipping_cost)
            .bind(new_order.total_amount)
            .bind(new_order.carrier.as_str())
            .bind(Json(&new_order.shipping_address))
            .bind(new_order.payment_method.as_str())
            .bind(new_order.idempotency_key.as_ref().map(IdempotencyKey::as_str))
            .fetch_one(&mut *tx)
            .await?;
        let order = Order::try_from(record)?;

        // After the order insert, so a same-key twin surfaces as a unique violation first.
        let cart: Vec<(Uuid, i32)> = sqlx::query_as(LOCK_CART_SQL).bind(order.customer_id).fetch_all(&mut *tx).await?;
        let cart = cart
            .into_iter()
            .map(|(product_id, quantity)| Ok((ProductId::from_uuid(product_id), from_db_quantity(quantity)?)))
            .collect::<Result<Vec<_>>>()?;
        if !cart_matches(cart, &new_order.items) {
            return Err(CommerceError::CartChanged);
        }

        // Fixed lock order across concurrent checkouts.
        let mut lines = new_order.items;
        lines.sort_by_key(|l| l.product_id);
        let mut items = Vec::with_capacity(lines.len());
        for line in &lines {
            items.push(Self::decrement_and_record(&mut tx, order.id, line).await?);
        }

        sqlx::query("DELETE FROM cart_items WHERE customer_id = $1").bind(order.customer_id).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(OrderDetails { order, items })
    }

    async fn find_by_idempotency_key(&self, customer: CustomerId, key: IdempotencyKey) -> Result<Option<OrderDetails>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE customer_id = $1 AND idempotency_key = $2");
        let record = sqlx::query_as::<_, OrderRecord>(&sql).bind(customer).bind(key.as_str()).fetch_optional(&self.pool).await?;
        match record {
            Some(record) => Ok(Some(self.load_items(Order::try_from(record)?).await?)),
            None => Ok(None),
        }
    }

    async fn get(&self, customer: CustomerId, order: OrderId) -> Result<Option<OrderDetails>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE customer_id = $1 AND id = $2");
        let record = sqlx::query_as::<_, OrderRecord>(&sql).bind(customer).bind(order).fetch_optional(&self.pool).await?;
        match record {
            Some(record) => Ok(Some(self.load_items(Order::try_from(record)?).await?)),
            None => Ok(None),
        }
    }

    async fn list_for_customer(&self, customer: CustomerId, filter: OrderFilter) -> Result<Page<Order>> {
        self.fetch_page("o.customer_id = $1", customer.into_uuid(), &filter).await
    }

    async fn list_for_vendor(&self, vendor: VendorId, filter: OrderFilter) -> Result<Page<Order>> {
        self.fetch_page(
            "EXISTS (SELECT 1 FROM order_items oi WHERE oi.order_id = o.id AND oi.vendor_id = $1)",
            vendor.into_uuid(),
            &filter,
        )
        .await
    }
}

// =============================================================================
// Row records
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct CartItemRecord {
    id: Uuid,
    customer_id: Uuid,
    product_id: Uuid,
    quantity: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CartItemRecord> for CartItem {
    type Error = CommerceError;
    fn try_from(r: CartItemRecord) -> Result<Self> {
        Ok(CartItem {
            id: r.id.into(), customer_id: r.customer_id.into(), product_id: r.product_id.into(),
            quantity: from_db_quantity(r.quantity)?, created_at: r.created_at, updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CartLineRecord {
    id: Uuid,
    product_id: Uuid,
    quantity: i32,
    name: String,
    image_url: Option<String>,
    price: i64,
    stock_count: i32,
    in_stock: bool,
    vendor_id: Uuid,
}

impl TryFrom<CartLineRecord> for CartLine {
    type Error = CommerceError;
    fn try_from(r: CartLineRecord) -> Result<Self> {
        Ok(CartLine {
            id: r.id.into(), product_id: r.product_id.into(), quantity: from_db_quantity(r.quantity)?, name: r.name,
            image_url: r.image_url, unit_price: Money::from_minor(r.price), stock_count: r.stock_count,
            in_stock: r.in_stock, vendor_id: r.vendor_id.into(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRecord {
    id: Uuid,
    order_number: String,
    customer_id: Uuid,
    status: String,
    subtotal: i64,
    shipping_cost: i64,
    total_amount: i64,
    carrier: String,
    shipping_address: Json<ShippingAddress>,
    payment_method: String,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRecord> for Order {
    type Error = CommerceError;
    fn try_from(r: OrderRecord) -> Result<Self> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| CommerceError::StorageUnavailable(format!("order {} has bad {what}: {e}", r.id));
        Ok(Order {
            id: r.id.into(),
            order_number: OrderNumber::parse(r.order_number.clone()).map_err(|e| corrupt("order_number", &e))?,
            customer_id: r.customer_id.into(),
            status: r.status.parse().map_err(|e| corrupt("status", &e))?,
            subtotal: Money::from_minor(r.subtotal),
            shipping_cost: Money::from_minor(r.shipping_cost),
            total_amount: Money::from_minor(r.total_amount),
            carrier: r.carrier.parse().map_err(|e| corrupt("carrier", &e))?,
            shipping_address: r.shipping_address.0.clone(),
            payment_method: r.payment_method.parse().map_err(|e| corrupt("payment_method", &e))?,
            idempotency_key: r.idempotency_key.clone().and_then(|k| IdempotencyKey::new(k)),
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderItemRecord {
    order_id: Uuid,
    product_id: Uuid,
    vendor_id: Uuid,
    quantity: i32,
    unit_price: i64,
}

impl TryFrom<OrderItemRecord> for OrderItem {
    type Error = CommerceError;
    fn try_from(r: OrderItemRecord) -> Result<Self> {
        Ok(OrderItem {
            order_id: r.order_id.into(), product_id: r.product_id.into(), vendor_id: r.vendor_id.into(),
            quantity: from_db_quantity(r.quantity)?, unit_price: Money::from_minor(r.unit_price),
        })
    }
}

fn to_db_quantity(quantity: u32) -> Result<i32> {
    i32::try_from(quantity).map_err(|_| CommerceError::InvalidQuantity(i64::from(quantity)))
}

fn from_db_quantity(quantity: i32) -> Result<u32> {
    u32::try_from(quantity).map_err(|_| CommerceError::StorageUnavailable(format!("negative quantity {quantity} in storage")))
}
