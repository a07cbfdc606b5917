//! Append-only audit and fraud-signal trail
//!
//! Every component reports what it did through [`AuditLogger::record`]. Each
//! [`ActionKind`] carries an explicit severity, so adding a new kind forces a
//! decision about whether it pages someone. Recording never fails outward: if
//! the sink is unavailable the entry is written to the tracing fallback target
//! and the business operation carries on.

use crate::clock::Clock;
use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    WebhookSignatureInvalid,
    WebhookValidationFailed,
    WebhookAcknowledged,
    FraudAttempt,
    PaymentQueued,
    PaymentVerified,
    PaymentMismatch,
    VerificationAbandoned,
    PayoutAutoReverted,
    PayoutBlocked,
    PayoutTransitionRejected,
    OtpIssued,
    OtpDispatchFailed,
    OtpVerified,
    OtpVerificationFailed,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::WebhookSignatureInvalid => "webhook_signature_invalid",
            ActionKind::WebhookValidationFailed => "webhook_validation_failed",
            ActionKind::WebhookAcknowledged => "webhook_acknowledged",
            ActionKind::FraudAttempt => "fraud_attempt",
            ActionKind::PaymentQueued => "payment_queued",
            ActionKind::PaymentVerified => "payment_verified",
            ActionKind::PaymentMismatch => "payment_mismatch",
            ActionKind::VerificationAbandoned => "verification_abandoned",
            ActionKind::PayoutAutoReverted => "payout_auto_reverted",
            ActionKind::PayoutBlocked => "payout_blocked",
            ActionKind::PayoutTransitionRejected => "payout_transition_rejected",
            ActionKind::OtpIssued => "otp_issued",
            ActionKind::OtpDispatchFailed => "otp_dispatch_failed",
            ActionKind::OtpVerified => "otp_verified",
            ActionKind::OtpVerificationFailed => "otp_verification_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webhook_signature_invalid" => Some(ActionKind::WebhookSignatureInvalid),
            "webhook_validation_failed" => Some(ActionKind::WebhookValidationFailed),
            "webhook_acknowledged" => Some(ActionKind::WebhookAcknowledged),
            "fraud_attempt" => Some(ActionKind::FraudAttempt),
            "payment_queued" => Some(ActionKind::PaymentQueued),
            "payment_verified" => Some(ActionKind::PaymentVerified),
            "payment_mismatch" => Some(ActionKind::PaymentMismatch),
            "verification_abandoned" => Some(ActionKind::VerificationAbandoned),
            "payout_auto_reverted" => Some(ActionKind::PayoutAutoReverted),
            "payout_blocked" => Some(ActionKind::PayoutBlocked),
            "payout_transition_rejected" => Some(ActionKind::PayoutTransitionRejected),
            "otp_issued" => Some(ActionKind::OtpIssued),
            "otp_dispatch_failed" => Some(ActionKind::OtpDispatchFailed),
            "otp_verified" => Some(ActionKind::OtpVerified),
            "otp_verification_failed" => Some(ActionKind::OtpVerificationFailed),
            _ => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ActionKind::FraudAttempt
            | ActionKind::WebhookSignatureInvalid
            | ActionKind::PaymentMismatch
            | ActionKind::VerificationAbandoned
            | ActionKind::PayoutBlocked
            | ActionKind::PayoutTransitionRejected
            | ActionKind::OtpVerificationFailed => Severity::Critical,
            ActionKind::WebhookValidationFailed
            | ActionKind::WebhookAcknowledged
            | ActionKind::PaymentQueued
            | ActionKind::PaymentVerified
            | ActionKind::PayoutAutoReverted
            | ActionKind::OtpIssued
            | ActionKind::OtpDispatchFailed
            | ActionKind::OtpVerified => Severity::Info,
        }
    }

    /// Human-readable line for dashboards and alert bodies.
    pub fn describe(&self, context: &Value) -> String {
        let field = |key: &str| -> String {
            match context.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => "unknown".to_string(),
                Some(other) => other.to_string(),
            }
        };

        match self {
            ActionKind::WebhookSignatureInvalid => {
                format!("Rejected webhook with invalid signature: {}", field("reason"))
            }
            ActionKind::WebhookValidationFailed => {
                format!("Rejected malformed payment webhook ({} field errors)", field("error_count"))
            }
            ActionKind::WebhookAcknowledged => format!(
                "Acknowledged {} payment notification {} without processing",
                field("status"),
                field("transaction_reference")
            ),
            ActionKind::FraudAttempt => format!(
                "Payment {} references unknown order {}",
                field("transaction_reference"),
                field("order_id")
            ),
            ActionKind::PaymentQueued => format!(
                "Payment {} queued for verification against order {}",
                field("transaction_reference"),
                field("order_id")
            ),
            ActionKind::PaymentVerified => format!(
                "Payment {} verified for order {}",
                field("transaction_reference"),
                field("order_id")
            ),
            ActionKind::PaymentMismatch => format!(
                "Payment {} amount {} does not match order {} total {}",
                field("transaction_reference"),
                field("received_amount"),
                field("order_id"),
                field("expected_amount")
            ),
            ActionKind::VerificationAbandoned => format!(
                "Gave up verifying payment {} for order {} after {} attempts: {}",
                field("transaction_reference"),
                field("order_id"),
                field("attempts"),
                field("error")
            ),
            ActionKind::PayoutAutoReverted => format!(
                "Payout for order {} auto-reverted from {} after {} hours",
                field("order_id"),
                field("prior_status"),
                field("elapsed_hours")
            ),
            ActionKind::PayoutBlocked => format!(
                "Payout for order {} blocked: {}",
                field("order_id"),
                field("reason")
            ),
            ActionKind::PayoutTransitionRejected => format!(
                "Rejected payout transition {} -> {} for order {}",
                field("from"),
                field("to"),
                field("order_id")
            ),
            ActionKind::OtpIssued => format!("Delivery code issued for order {}", field("order_id")),
            ActionKind::OtpDispatchFailed => format!(
                "Delivery code for order {} could not be sent: {}",
                field("order_id"),
                field("error")
            ),
            ActionKind::OtpVerified => {
                format!("Delivery code accepted for order {}", field("order_id"))
            }
            ActionKind::OtpVerificationFailed => format!(
                "Delivery code rejected for order {}: {}",
                field("order_id"),
                field("reason")
            ),
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: ActionKind,
    pub severity: Severity,
    pub actor_id: String,
    pub source_address: Option<String>,
    pub message: String,
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

/// Destination for audit entries. Implementations only ever append.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<(), DatabaseError>;
}

#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self { sink, clock }
    }

    pub async fn record(
        &self,
        action: ActionKind,
        actor_id: Option<&str>,
        source_address: Option<&str>,
        context: Value,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            action,
            severity: action.severity(),
            actor_id: actor_id.unwrap_or(SYSTEM_ACTOR).to_string(),
            source_address: source_address.map(str::to_string),
            message: action.describe(&context),
            context,
            created_at: self.clock.now(),
        };

        match entry.severity {
            Severity::Critical => warn!(action = %action, "{}", entry.message),
            Severity::Info => info!(action = %action, "{}", entry.message),
        }

        if let Err(e) = self.sink.append(&entry).await {
            // Auditing must never block the caller.
            error!(
                target: "audit_fallback",
                error = %e,
                action = %entry.action,
                severity = entry.severity.as_str(),
                actor = %entry.actor_id,
                context = %entry.context,
                "failed to persist audit entry: {}",
                entry.message
            );
        }
    }

    pub async fn system(&self, action: ActionKind, context: Value) {
        self.record(action, None, None, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::database::error::DatabaseErrorKind;
    use crate::database::memory::InMemoryAuditSink;
    use serde_json::json;

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn append(&self, _entry: &AuditEntry) -> Result<(), DatabaseError> {
            Err(DatabaseError::new(DatabaseErrorKind::ConnectionError {
                message: "audit table unavailable".to_string(),
            }))
        }
    }

    #[test]
    fn test_fraud_signals_are_critical() {
        assert_eq!(ActionKind::FraudAttempt.severity(), Severity::Critical);
        assert_eq!(ActionKind::PayoutBlocked.severity(), Severity::Critical);
        assert_eq!(ActionKind::OtpVerificationFailed.severity(), Severity::Critical);
        assert_eq!(ActionKind::VerificationAbandoned.severity(), Severity::Critical);
        assert_eq!(ActionKind::PaymentVerified.severity(), Severity::Info);
        assert_eq!(ActionKind::PayoutAutoReverted.severity(), Severity::Info);
    }

    #[test]
    fn test_describe_fills_template_from_context() {
        let message = ActionKind::FraudAttempt.describe(&json!({
            "transaction_reference": "TX-1",
            "order_id": "ORD-404",
        }));
        assert_eq!(message, "Payment TX-1 references unknown order ORD-404");

        let message = ActionKind::PayoutAutoReverted.describe(&json!({
            "order_id": "ORD-1",
            "prior_status": "receipt_confirmed",
            "elapsed_hours": 50,
        }));
        assert!(message.contains("after 50 hours"));
    }

    #[tokio::test]
    async fn test_record_appends_with_derived_fields() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let logger = AuditLogger::new(sink.clone(), Arc::new(SystemClock));

        logger
            .record(
                ActionKind::OtpVerificationFailed,
                Some("courier-7"),
                Some("10.0.0.1"),
                json!({"order_id": "ORD-1", "reason": "code mismatch"}),
            )
            .await;

        let entries = sink.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, Severity::Critical);
        assert_eq!(entries[0].actor_id, "courier-7");
        assert_eq!(entries[0].source_address.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_propagate() {
        let logger = AuditLogger::new(Arc::new(BrokenSink), Arc::new(SystemClock));
        // Completes without panicking or returning an error.
        logger
            .system(ActionKind::PaymentVerified, json!({"order_id": "ORD-1"}))
            .await;
    }
}
