//! Canonical payment types
//!
//! Records shared by the gateway, the verification worker and the stores.
//! Status enums are stored as snake_case text columns.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order as exposed by the commerce subsystem. Read-only for this service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub order_number: String,
    pub total_amount: Decimal,
    pub customer_phone: String,
    pub delivery_address: Option<String>,
    pub status: String,
}

/// Status reported by the payment provider in the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Successful,
    Failed,
    Pending,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Successful => "successful",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "successful" => Some(NotificationStatus::Successful),
            "failed" => Some(NotificationStatus::Failed),
            "pending" => Some(NotificationStatus::Pending),
            _ => None,
        }
    }
}

/// A webhook that passed normalization and field validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalPayment {
    pub amount: Decimal,
    pub transaction_reference: String,
    pub order_id: String,
    pub customer_phone: String,
    pub payment_date: DateTime<Utc>,
    pub status: NotificationStatus,
}

/// Unit of work handed to the verification worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationTask {
    pub amount: Decimal,
    pub transaction_reference: String,
    pub order_id: String,
    pub customer_phone: String,
    pub payment_date: DateTime<Utc>,
    pub raw_payload: serde_json::Value,
}

impl VerificationTask {
    pub fn from_payment(payment: &CanonicalPayment, raw_payload: serde_json::Value) -> Self {
        Self {
            amount: payment.amount,
            transaction_reference: payment.transaction_reference.clone(),
            order_id: payment.order_id.clone(),
            customer_phone: payment.customer_phone.clone(),
            payment_date: payment.payment_date,
            raw_payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    VerificationFailed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::VerificationFailed => "verification_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "confirmed" => Some(PaymentStatus::Confirmed),
            "verification_failed" => Some(PaymentStatus::VerificationFailed),
            _ => None,
        }
    }

    /// Once a payment is settled either way the worker never touches it again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// Payment row, one per transaction reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub transaction_reference: String,
    pub order_id: String,
    pub amount: Decimal,
    pub customer_phone: String,
    pub payment_date: DateTime<Utc>,
    pub status: PaymentStatus,
    pub raw_payload: serde_json::Value,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    pub fn pending(task: &VerificationTask, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_reference: task.transaction_reference.clone(),
            order_id: task.order_id.clone(),
            amount: task.amount,
            customer_phone: task.customer_phone.clone(),
            payment_date: task.payment_date,
            status: PaymentStatus::Pending,
            raw_payload: task.raw_payload.clone(),
            verified_at: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchStatus {
    Open,
    Resolved,
}

impl MismatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MismatchStatus::Open => "open",
            MismatchStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(MismatchStatus::Open),
            "resolved" => Some(MismatchStatus::Resolved),
            _ => None,
        }
    }
}

/// Disagreement between what the provider reported and what the order expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentMismatch {
    pub id: Uuid,
    pub transaction_reference: String,
    pub order_id: String,
    pub expected_amount: Decimal,
    pub received_amount: Decimal,
    /// expected minus received
    pub delta: Decimal,
    pub status: MismatchStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PaymentMismatch {
    pub fn open(
        transaction_reference: &str,
        order_id: &str,
        expected_amount: Decimal,
        received_amount: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_reference: transaction_reference.to_string(),
            order_id: order_id.to_string(),
            expected_amount,
            received_amount,
            delta: expected_amount - received_amount,
            status: MismatchStatus::Open,
            resolved_at: None,
            resolution_note: None,
            created_at: now,
        }
    }
}

/// Outcome of an insert guarded by a unique key.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    Created(T),
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            InsertOutcome::Created(v) | InsertOutcome::Existing(v) => v,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }
}

/// Raw inbound webhook attempt, written before any validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawWebhookAttempt {
    pub id: Uuid,
    pub source: String,
    pub source_address: Option<String>,
    pub headers: serde_json::Value,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_mismatch_delta_is_expected_minus_received() {
        let mismatch = PaymentMismatch::open("TX-9", "ORD-1", dec!(5000), dec!(4500), Utc::now());
        assert_eq!(mismatch.delta, dec!(500));
        assert_eq!(mismatch.status, MismatchStatus::Open);
    }

    #[test]
    fn test_payment_status_terminality() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Confirmed.is_terminal());
        assert!(PaymentStatus::VerificationFailed.is_terminal());
        assert_eq!(
            PaymentStatus::parse(PaymentStatus::VerificationFailed.as_str()),
            Some(PaymentStatus::VerificationFailed)
        );
    }
}
