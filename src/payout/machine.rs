//! Authoritative payout transitions
//!
//! Every transition is checked against the lifecycle graph and the caller's
//! authority, then applied as a compare-and-set on the status the caller last
//! saw. Attempts to leave a terminal state are recorded as anomalies.

use crate::audit::{ActionKind, AuditLogger};
use crate::clock::Clock;
use crate::database::error::DatabaseError;
use crate::database::repository::PayoutRepository;
use crate::payout::state::{
    Payout, PayoutStatus, TransitionAuthority, TransitionRejection,
};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("no payout exists for order {order_id}")]
    NotFound { order_id: String },

    #[error("payout for order {order_id} is terminal ({status})")]
    Terminal { order_id: String, status: PayoutStatus },

    #[error("illegal payout transition {from} -> {to}")]
    Illegal { from: PayoutStatus, to: PayoutStatus },

    #[error("{authority} may not move a payout to {to}")]
    Unauthorized {
        authority: TransitionAuthority,
        to: PayoutStatus,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Payout),
    /// Someone else moved the row first; `current` is what they left.
    Lost { current: PayoutStatus },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

#[derive(Clone)]
pub struct PayoutStateMachine {
    payouts: Arc<dyn PayoutRepository>,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
}

impl PayoutStateMachine {
    pub fn new(
        payouts: Arc<dyn PayoutRepository>,
        audit: AuditLogger,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            payouts,
            audit,
            clock,
        }
    }

    /// Create the order's payout in `intent_marked`, or return the existing one.
    pub async fn mark_intent(&self, order_id: &str) -> Result<Payout, TransitionError> {
        let outcome = self.payouts.mark_intent(order_id, self.clock.now()).await?;
        if outcome.is_created() {
            debug!(order_id = %order_id, "payout intent marked");
        }
        Ok(outcome.into_inner())
    }

    pub async fn find(&self, order_id: &str) -> Result<Option<Payout>, TransitionError> {
        Ok(self.payouts.find_by_order(order_id).await?)
    }

    pub async fn transition_order(
        &self,
        order_id: &str,
        next: PayoutStatus,
        authority: TransitionAuthority,
    ) -> Result<TransitionOutcome, TransitionError> {
        let payout = self
            .payouts
            .find_by_order(order_id)
            .await?
            .ok_or_else(|| TransitionError::NotFound {
                order_id: order_id.to_string(),
            })?;
        self.transition(&payout, next, authority).await
    }

    /// Apply `payout.status -> next` if the stored row still has `payout.status`.
    pub async fn transition(
        &self,
        payout: &Payout,
        next: PayoutStatus,
        authority: TransitionAuthority,
    ) -> Result<TransitionOutcome, TransitionError> {
        if let Err(rejection) = payout.status.check_transition(next, authority) {
            return Err(self.reject(payout, next, authority, rejection).await);
        }

        let now = self.clock.now();
        if self
            .payouts
            .compare_and_set(payout.id, payout.status, next, now)
            .await?
        {
            debug!(
                order_id = %payout.order_id,
                from = %payout.status,
                to = %next,
                "payout transitioned"
            );
            return Ok(TransitionOutcome::Applied(Payout {
                status: next,
                updated_at: now,
                ..payout.clone()
            }));
        }

        let current = self
            .payouts
            .find_by_order(&payout.order_id)
            .await?
            .map(|p| p.status)
            .ok_or_else(|| TransitionError::NotFound {
                order_id: payout.order_id.clone(),
            })?;

        if current.is_terminal() && current != next {
            self.record_terminal_anomaly(&payout.order_id, current, next, authority)
                .await;
        }
        Ok(TransitionOutcome::Lost { current })
    }

    /// Compliance hold, triggered from outside the core.
    pub async fn block(
        &self,
        order_id: &str,
        actor_id: &str,
        reason: &str,
    ) -> Result<TransitionOutcome, TransitionError> {
        let outcome = self
            .transition_order(order_id, PayoutStatus::Blocked, TransitionAuthority::Compliance)
            .await?;

        if outcome.is_applied() {
            self.audit
                .record(
                    ActionKind::PayoutBlocked,
                    Some(actor_id),
                    None,
                    json!({ "order_id": order_id, "reason": reason }),
                )
                .await;
        }
        Ok(outcome)
    }

    async fn reject(
        &self,
        payout: &Payout,
        next: PayoutStatus,
        authority: TransitionAuthority,
        rejection: TransitionRejection,
    ) -> TransitionError {
        match rejection {
            TransitionRejection::Terminal => {
                self.record_terminal_anomaly(&payout.order_id, payout.status, next, authority)
                    .await;
                TransitionError::Terminal {
                    order_id: payout.order_id.clone(),
                    status: payout.status,
                }
            }
            TransitionRejection::Illegal => {
                warn!(
                    order_id = %payout.order_id,
                    from = %payout.status,
                    to = %next,
                    "illegal payout transition requested"
                );
                TransitionError::Illegal {
                    from: payout.status,
                    to: next,
                }
            }
            TransitionRejection::Unauthorized => {
                warn!(
                    order_id = %payout.order_id,
                    authority = authority.as_str(),
                    to = %next,
                    "unauthorized payout transition requested"
                );
                TransitionError::Unauthorized {
                    authority,
                    to: next,
                }
            }
        }
    }

    async fn record_terminal_anomaly(
        &self,
        order_id: &str,
        from: PayoutStatus,
        to: PayoutStatus,
        authority: TransitionAuthority,
    ) {
        self.audit
            .system(
                ActionKind::PayoutTransitionRejected,
                json!({
                    "order_id": order_id,
                    "from": from.as_str(),
                    "to": to.as_str(),
                    "authority": authority.as_str(),
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Severity;
    use crate::clock::ManualClock;
    use crate::database::memory::{InMemoryAuditSink, InMemoryPayouts};

    struct Fixture {
        machine: PayoutStateMachine,
        payouts: Arc<InMemoryPayouts>,
        audit: Arc<InMemoryAuditSink>,
    }

    fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let payouts = Arc::new(InMemoryPayouts::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let logger = AuditLogger::new(audit.clone(), clock.clone());
        Fixture {
            machine: PayoutStateMachine::new(payouts.clone(), logger, clock),
            payouts,
            audit,
        }
    }

    #[tokio::test]
    async fn test_mark_intent_is_idempotent() {
        let f = fixture();
        let first = f.machine.mark_intent("ORD-1").await.unwrap();
        let second = f.machine.mark_intent("ORD-1").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, PayoutStatus::IntentMarked);
    }

    #[tokio::test]
    async fn test_happy_path() {
        let f = fixture();
        f.machine.mark_intent("ORD-1").await.unwrap();

        for next in [PayoutStatus::ReceiptConfirmed, PayoutStatus::Confirmed] {
            let outcome = f
                .machine
                .transition_order("ORD-1", next, TransitionAuthority::VerificationWorker)
                .await
                .unwrap();
            assert!(outcome.is_applied());
        }

        let payout = f.payouts.find_by_order("ORD-1").await.unwrap().unwrap();
        assert_eq!(payout.status, PayoutStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_terminal_transition_is_noop_and_audited() {
        let f = fixture();
        f.machine.mark_intent("ORD-1").await.unwrap();
        f.machine.block("ORD-1", "compliance-officer", "sanctions hit").await.unwrap();

        let err = f
            .machine
            .transition_order("ORD-1", PayoutStatus::AutoReverted, TransitionAuthority::Reaper)
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::Terminal { status: PayoutStatus::Blocked, .. }));

        let payout = f.payouts.find_by_order("ORD-1").await.unwrap().unwrap();
        assert_eq!(payout.status, PayoutStatus::Blocked);

        let entries = f.audit.entries().await;
        let kinds: Vec<ActionKind> = entries.iter().map(|e| e.action).collect();
        assert_eq!(
            kinds,
            vec![ActionKind::PayoutBlocked, ActionKind::PayoutTransitionRejected]
        );
        assert!(entries.iter().all(|e| e.severity == Severity::Critical));
        assert_eq!(entries[0].actor_id, "compliance-officer");
    }

    #[tokio::test]
    async fn test_stale_snapshot_loses_cas() {
        let f = fixture();
        let snapshot = f.machine.mark_intent("ORD-1").await.unwrap();
        f.machine
            .transition(&snapshot, PayoutStatus::AutoReverted, TransitionAuthority::Reaper)
            .await
            .unwrap();

        // Worker still holds the intent_marked snapshot.
        let outcome = f
            .machine
            .transition(
                &snapshot,
                PayoutStatus::ReceiptConfirmed,
                TransitionAuthority::VerificationWorker,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Lost {
                current: PayoutStatus::AutoReverted
            }
        );
        assert_eq!(
            f.audit.count(ActionKind::PayoutTransitionRejected).await,
            1
        );
    }

    #[tokio::test]
    async fn test_wrong_authority_is_rejected() {
        let f = fixture();
        f.machine.mark_intent("ORD-1").await.unwrap();
        let err = f
            .machine
            .transition_order(
                "ORD-1",
                PayoutStatus::AutoReverted,
                TransitionAuthority::VerificationWorker,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_missing_payout() {
        let f = fixture();
        let err = f
            .machine
            .block("ORD-404", "officer", "test")
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::NotFound { .. }));
    }
}
