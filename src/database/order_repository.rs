use crate::database::error::{DatabaseError, DbResult};
use crate::payments::traits::OrderLookup;
use crate::payments::types::Order;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, FromRow)]
struct OrderRow {
    order_number: String,
    total_amount: Decimal,
    customer_phone: String,
    delivery_address: Option<String>,
    status: String,
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        Order {
            order_number: row.order_number,
            total_amount: row.total_amount,
            customer_phone: row.customer_phone,
            delivery_address: row.delivery_address,
            status: row.status,
        }
    }
}

/// Reads the commerce `orders` table. Never writes to it.
pub struct PgOrderLookup {
    pool: PgPool,
}

impl PgOrderLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderLookup for PgOrderLookup {
    async fn find_order(&self, order_number: &str) -> DbResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT order_number, total_amount, customer_phone, delivery_address, status
             FROM orders WHERE order_number = $1",
        )
        .bind(order_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(Order::from))
    }
}
