//! Delivery one-time codes
//!
//! A code is issued once an order's payout is `confirmed` and is the only
//! thing that authorizes the physical handover. Dispatch to the customer is
//! retried independently of issuance, so a notification outage never undoes
//! a confirmed payout.

use crate::audit::{ActionKind, AuditLogger};
use crate::clock::Clock;
use crate::database::error::DatabaseError;
use crate::database::repository::{OtpRepository, PayoutRepository};
use crate::error::{AppError, AppResult};
use crate::notifications::{NotificationSink, OrderContext};
use crate::payments::types::Order;
use crate::payout::state::PayoutStatus;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const OTP_DIGITS: usize = 6;

/// Wrong guesses after which a code stops being accepted.
pub const MAX_OTP_FAILED_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryOtp {
    pub id: Uuid,
    pub order_id: String,
    pub code: String,
    pub phone: String,
    pub delivery_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub failed_attempts: i32,
}

impl DeliveryOtp {
    pub fn generate(order: &Order, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: order.order_number.clone(),
            code: generate_code(),
            phone: order.customer_phone.clone(),
            delivery_address: order.delivery_address.clone(),
            created_at: now,
            dispatched_at: None,
            consumed_at: None,
            failed_attempts: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.failed_attempts >= MAX_OTP_FAILED_ATTEMPTS
    }

    fn context(&self) -> OrderContext {
        OrderContext {
            order_id: self.order_id.clone(),
            delivery_address: self.delivery_address.clone(),
        }
    }
}

pub fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{:0width$}", n, width = OTP_DIGITS)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Issues codes and pushes them to the customer.
#[derive(Clone)]
pub struct OtpIssuer {
    otps: Arc<dyn OtpRepository>,
    notifier: Arc<dyn NotificationSink>,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
}

impl OtpIssuer {
    pub fn new(
        otps: Arc<dyn OtpRepository>,
        notifier: Arc<dyn NotificationSink>,
        audit: AuditLogger,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            otps,
            notifier,
            audit,
            clock,
        }
    }

    /// Store a code for `order` (reusing one that already exists) and try to
    /// send it. Returns the stored code; dispatch failures are audited, not
    /// returned.
    pub async fn issue(&self, order: &Order) -> Result<DeliveryOtp, DatabaseError> {
        let candidate = DeliveryOtp::generate(order, self.clock.now());
        let outcome = self.otps.issue(&candidate).await?;
        let created = outcome.is_created();
        let otp = outcome.into_inner();

        if created {
            self.audit
                .system(ActionKind::OtpIssued, json!({ "order_id": otp.order_id }))
                .await;
        }

        if otp.dispatched_at.is_none() {
            self.dispatch(&otp).await?;
        }
        Ok(otp)
    }

    /// Retry codes whose earlier dispatch failed.
    pub async fn redispatch_pending(&self, limit: i64) -> Result<usize, DatabaseError> {
        let pending = self.otps.pending_dispatch(limit).await?;
        let mut sent = 0;
        for otp in pending {
            if self.dispatch(&otp).await? {
                sent += 1;
            }
        }
        if sent > 0 {
            info!(count = sent, "redispatched delivery codes");
        }
        Ok(sent)
    }

    async fn dispatch(&self, otp: &DeliveryOtp) -> Result<bool, DatabaseError> {
        match self
            .notifier
            .send_otp(&otp.phone, &otp.code, &otp.context())
            .await
        {
            Ok(()) => {
                self.otps.mark_dispatched(otp.id, self.clock.now()).await?;
                Ok(true)
            }
            Err(e) => {
                warn!(order_id = %otp.order_id, error = %e, "delivery code dispatch failed");
                self.audit
                    .system(
                        ActionKind::OtpDispatchFailed,
                        json!({
                            "order_id": otp.order_id,
                            "error": e.to_string(),
                            "retryable": e.is_retryable(),
                        }),
                    )
                    .await;
                Ok(false)
            }
        }
    }
}

/// Checks a presented code before the courier hands over the goods.
#[derive(Clone)]
pub struct DeliveryGate {
    otps: Arc<dyn OtpRepository>,
    payouts: Arc<dyn PayoutRepository>,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
}

impl DeliveryGate {
    pub fn new(
        otps: Arc<dyn OtpRepository>,
        payouts: Arc<dyn PayoutRepository>,
        audit: AuditLogger,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            otps,
            payouts,
            audit,
            clock,
        }
    }

    pub async fn verify(
        &self,
        order_id: &str,
        presented_code: &str,
        actor_id: Option<&str>,
        source_address: Option<&str>,
    ) -> AppResult<()> {
        let payout_status = self.payouts.find_by_order(order_id).await?.map(|p| p.status);
        if payout_status != Some(PayoutStatus::Confirmed) {
            let status = payout_status.map(|s| s.as_str()).unwrap_or("missing");
            return self
                .refuse(order_id, &format!("payout is {}", status), actor_id, source_address)
                .await;
        }

        let otp = match self.otps.find_by_order(order_id).await? {
            Some(otp) => otp,
            None => {
                return self
                    .refuse(order_id, "no delivery code issued", actor_id, source_address)
                    .await
            }
        };

        if otp.consumed_at.is_some() {
            return self
                .refuse(order_id, "delivery code already used", actor_id, source_address)
                .await;
        }

        if otp.is_locked() {
            return self
                .refuse(order_id, "delivery code locked", actor_id, source_address)
                .await;
        }

        if !constant_time_eq(otp.code.as_str(), presented_code.trim()) {
            let failed = self.otps.record_failed_attempt(otp.id).await?;
            if failed >= MAX_OTP_FAILED_ATTEMPTS {
                warn!(order_id = %order_id, failed, "delivery code locked after repeated mismatches");
            }
            return self
                .refuse(order_id, "delivery code mismatch", actor_id, source_address)
                .await;
        }

        if !self.otps.consume(otp.id, self.clock.now()).await? {
            return self
                .refuse(order_id, "delivery code already used", actor_id, source_address)
                .await;
        }

        self.audit
            .record(
                ActionKind::OtpVerified,
                actor_id,
                source_address,
                json!({ "order_id": order_id }),
            )
            .await;
        Ok(())
    }

    async fn refuse(
        &self,
        order_id: &str,
        reason: &str,
        actor_id: Option<&str>,
        source_address: Option<&str>,
    ) -> AppResult<()> {
        self.audit
            .record(
                ActionKind::OtpVerificationFailed,
                actor_id,
                source_address,
                json!({ "order_id": order_id, "reason": reason }),
            )
            .await;
        Err(AppError::DeliveryRejected {
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_codes_are_six_digits() {
        for _ in 0..100 {
            let code = generate_code();
            assert_eq!(code.len(), OTP_DIGITS);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_code_locks_at_failure_limit() {
        let order = Order {
            order_number: "ORD-1".to_string(),
            total_amount: rust_decimal::Decimal::new(5000, 0),
            customer_phone: "0971234567".to_string(),
            delivery_address: None,
            status: "pending".to_string(),
        };
        let mut otp = DeliveryOtp::generate(&order, Utc::now());
        assert!(!otp.is_locked());

        otp.failed_attempts = MAX_OTP_FAILED_ATTEMPTS - 1;
        assert!(!otp.is_locked());
        otp.failed_attempts = MAX_OTP_FAILED_ATTEMPTS;
        assert!(otp.is_locked());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("042917", "042917"));
        assert!(!constant_time_eq("042917", "042918"));
        assert!(!constant_time_eq("042917", "04291"));
    }
}
