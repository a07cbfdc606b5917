//! In-process domain events
//!
//! Published after the corresponding state change is committed. Delivery is
//! best-effort: with no subscribers, or a lagging one, events are dropped.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    OrderReceived {
        order_id: String,
        transaction_reference: String,
        amount: Decimal,
    },
    PaymentVerified {
        order_id: String,
        transaction_reference: String,
    },
    PaymentMismatch {
        order_id: String,
        transaction_reference: String,
        delta: Decimal,
    },
    PayoutAutoReverted {
        order_id: String,
        prior_status: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: DomainEvent) {
        if self.sender.send(event).is_err() {
            debug!("domain event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::OrderReceived {
            order_id: "ORD-100".to_string(),
            transaction_reference: "TX-1".to_string(),
            amount: dec!(5000),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, DomainEvent::OrderReceived { ref order_id, .. } if order_id == "ORD-100"));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        EventBus::new(4).publish(DomainEvent::PaymentVerified {
            order_id: "ORD-1".to_string(),
            transaction_reference: "TX-1".to_string(),
        });
    }
}
