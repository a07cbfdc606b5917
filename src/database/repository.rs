use crate::database::error::DbResult;
use crate::payments::types::{InsertOutcome, Payment, PaymentMismatch, RawWebhookAttempt};
use crate::payout::delivery::DeliveryOtp;
use crate::payout::state::{Payout, PayoutStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Payment rows keyed by transaction reference
///
/// Status changes are compare-and-set against `pending`, so concurrent
/// workers holding the same task can never both apply a side effect.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Insert unless a row with the same transaction reference exists.
    async fn insert_if_absent(&self, payment: &Payment) -> DbResult<InsertOutcome<Payment>>;

    async fn find_by_reference(&self, reference: &str) -> DbResult<Option<Payment>>;

    /// `pending -> confirmed`. Returns false if the row was not pending.
    async fn mark_confirmed(&self, reference: &str, verified_at: DateTime<Utc>) -> DbResult<bool>;

    /// `pending -> verification_failed` and insert the mismatch, atomically.
    /// Returns false (and inserts nothing) if the row was not pending.
    async fn record_mismatch(
        &self,
        mismatch: &PaymentMismatch,
        verified_at: DateTime<Utc>,
    ) -> DbResult<bool>;

    async fn mismatches_for_order(&self, order_id: &str) -> DbResult<Vec<PaymentMismatch>>;
}

/// Payout rows, one per order
#[async_trait]
pub trait PayoutRepository: Send + Sync {
    /// Create the payout in `intent_marked` unless the order already has one.
    async fn mark_intent(&self, order_id: &str, now: DateTime<Utc>) -> DbResult<InsertOutcome<Payout>>;

    async fn find_by_order(&self, order_id: &str) -> DbResult<Option<Payout>>;

    /// Move `payout_id` to `next` only if it is currently `expected`.
    async fn compare_and_set(
        &self,
        payout_id: Uuid,
        expected: PayoutStatus,
        next: PayoutStatus,
        now: DateTime<Utc>,
    ) -> DbResult<bool>;

    /// Oldest first, bounded by `limit`.
    async fn find_stale(
        &self,
        statuses: &[PayoutStatus],
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Payout>>;
}

/// Delivery codes, at most one per order
#[async_trait]
pub trait OtpRepository: Send + Sync {
    async fn issue(&self, otp: &DeliveryOtp) -> DbResult<InsertOutcome<DeliveryOtp>>;

    async fn find_by_order(&self, order_id: &str) -> DbResult<Option<DeliveryOtp>>;

    /// Stamp `consumed_at` if still unconsumed. Returns false if already used.
    async fn consume(&self, otp_id: Uuid, now: DateTime<Utc>) -> DbResult<bool>;

    /// Count a wrong guess against the code. Returns the new total.
    async fn record_failed_attempt(&self, otp_id: Uuid) -> DbResult<i32>;

    async fn mark_dispatched(&self, otp_id: Uuid, now: DateTime<Utc>) -> DbResult<()>;

    /// Unconsumed codes that never reached the customer.
    async fn pending_dispatch(&self, limit: i64) -> DbResult<Vec<DeliveryOtp>>;
}

/// Raw inbound webhook log
#[async_trait]
pub trait WebhookLogRepository: Send + Sync {
    async fn log_attempt(&self, attempt: &RawWebhookAttempt) -> DbResult<()>;
}
