//! Resolves a validated payment to the order it claims to pay for.

use crate::error::{AppError, AppResult};
use crate::payments::traits::OrderLookup;
use crate::payments::types::{CanonicalPayment, Order};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct OrderCorrelator {
    orders: Arc<dyn OrderLookup>,
}

impl OrderCorrelator {
    pub fn new(orders: Arc<dyn OrderLookup>) -> Self {
        Self { orders }
    }

    pub async fn correlate(&self, payment: &CanonicalPayment) -> AppResult<Order> {
        let order = self
            .orders
            .find_order(&payment.order_id)
            .await?
            .ok_or_else(|| AppError::UnknownOrder {
                order_id: payment.order_id.clone(),
            })?;

        debug!(
            order_id = %order.order_number,
            transaction_reference = %payment.transaction_reference,
            "payment correlated to order"
        );
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryOrders;
    use crate::payments::types::NotificationStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn payment(order_id: &str) -> CanonicalPayment {
        CanonicalPayment {
            amount: dec!(5000),
            transaction_reference: "TX-1".to_string(),
            order_id: order_id.to_string(),
            customer_phone: "0971234567".to_string(),
            payment_date: Utc::now(),
            status: NotificationStatus::Successful,
        }
    }

    #[tokio::test]
    async fn test_known_and_unknown_orders() {
        let orders = Arc::new(InMemoryOrders::new());
        orders.insert_order("ORD-100", dec!(5000), "0971234567").await;
        let correlator = OrderCorrelator::new(orders);

        let order = correlator.correlate(&payment("ORD-100")).await.unwrap();
        assert_eq!(order.total_amount, dec!(5000));

        let err = correlator.correlate(&payment("ORD-404")).await.unwrap_err();
        assert!(matches!(err, AppError::UnknownOrder { order_id } if order_id == "ORD-404"));
    }
}
