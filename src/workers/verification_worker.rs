//! Payment verification worker
//!
//! Drains the verification queue. Every task is safe to process more than
//! once: the payment row is unique per transaction reference and its status
//! only ever leaves `pending` through a compare-and-set, so exactly one
//! attempt applies the business effect and every other attempt is a no-op.

use crate::audit::{ActionKind, AuditLogger};
use crate::clock::Clock;
use crate::database::error::DatabaseError;
use crate::database::repository::PaymentRepository;
use crate::error::{AppError, AppResult};
use crate::events::{DomainEvent, EventBus};
use crate::payments::traits::{retry_delay, ClaimedTask, OrderLookup, TaskQueue};
use crate::payments::types::{Order, Payment, PaymentMismatch, PaymentStatus, VerificationTask};
use crate::payout::delivery::OtpIssuer;
use crate::payout::machine::{PayoutStateMachine, TransitionError, TransitionOutcome};
use crate::payout::state::{Payout, PayoutStatus, TransitionAuthority};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Largest absolute difference still treated as a match.
    pub amount_tolerance: Decimal,
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub claim_lease: chrono::Duration,
    /// Move the payout to `verification_failed` on an amount mismatch
    /// instead of leaving it for the reaper.
    pub fail_payout_on_mismatch: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            amount_tolerance: Decimal::ZERO,
            poll_interval: Duration::from_secs(5),
            batch_size: 20,
            claim_lease: chrono::Duration::minutes(5),
            fail_payout_on_mismatch: false,
        }
    }
}

impl VerificationConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        cfg.amount_tolerance = std::env::var("VERIFICATION_AMOUNT_TOLERANCE")
            .ok()
            .and_then(|v| Decimal::from_str(&v).ok())
            .filter(|d| !d.is_sign_negative())
            .unwrap_or(cfg.amount_tolerance);

        cfg.poll_interval = Duration::from_secs(
            std::env::var("VERIFICATION_POLL_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.poll_interval.as_secs()),
        );

        cfg.batch_size = std::env::var("VERIFICATION_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(cfg.batch_size);

        cfg.claim_lease = std::env::var("VERIFICATION_CLAIM_LEASE_SECONDS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .map(chrono::Duration::seconds)
            .unwrap_or(cfg.claim_lease);

        cfg.fail_payout_on_mismatch = std::env::var("VERIFICATION_FAIL_PAYOUT_ON_MISMATCH")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(cfg.fail_payout_on_mismatch);

        cfg
    }
}

/// What processing a task did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Confirmed,
    Mismatched,
    /// The payment was settled by an earlier attempt.
    AlreadySettled,
    /// A concurrent attempt settled the payment first.
    LostRace,
}

pub struct VerificationWorker {
    payments: Arc<dyn PaymentRepository>,
    orders: Arc<dyn OrderLookup>,
    queue: Arc<dyn TaskQueue>,
    machine: PayoutStateMachine,
    issuer: OtpIssuer,
    audit: AuditLogger,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: VerificationConfig,
}

impl VerificationWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payments: Arc<dyn PaymentRepository>,
        orders: Arc<dyn OrderLookup>,
        queue: Arc<dyn TaskQueue>,
        machine: PayoutStateMachine,
        issuer: OtpIssuer,
        audit: AuditLogger,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            payments,
            orders,
            queue,
            machine,
            issuer,
            audit,
            events,
            clock,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Starting verification worker...");

        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "verification worker cycle failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Verification worker received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!("Verification worker stopped");
    }

    /// Claim a batch, process it concurrently, then retry undelivered codes.
    ///
    /// Every spawned task is drained before returning; a failed queue update
    /// is logged and the claim left to expire.
    #[instrument(skip(self), name = "verification_worker_cycle")]
    pub async fn run_cycle(self: &Arc<Self>) -> Result<usize, DatabaseError> {
        let claimed_tasks = self
            .queue
            .claim(self.config.batch_size, self.clock.now(), self.config.claim_lease)
            .await?;
        let claimed = claimed_tasks.len();
        if claimed > 0 {
            debug!(claimed, "claimed verification tasks");
        }

        let mut set = JoinSet::new();
        for claimed_task in claimed_tasks {
            let worker = Arc::clone(self);
            set.spawn(async move {
                let result = worker.process(&claimed_task.task).await;
                (claimed_task, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((claimed_task, Ok(outcome))) => {
                    let reference = &claimed_task.task.transaction_reference;
                    debug!(transaction_reference = %reference, ?outcome, "verification task done");
                    if let Err(e) = self.queue.complete(reference, self.clock.now()).await {
                        error!(
                            transaction_reference = %reference,
                            error = %e,
                            retryable = e.is_retryable(),
                            "failed to mark verification task complete"
                        );
                    }
                }
                Ok((claimed_task, Err(e))) => self.record_failure(&claimed_task, &e).await,
                Err(e) => {
                    // Lease expiry hands the task out again.
                    error!(error = %e, "verification task panicked");
                }
            }
        }

        if let Err(e) = self.issuer.redispatch_pending(self.config.batch_size).await {
            error!(error = %e, "delivery code redispatch failed");
        }

        Ok(claimed)
    }

    /// Schedule the retry, or report the task once it has no attempts left.
    async fn record_failure(&self, claimed: &ClaimedTask, err: &AppError) {
        let task = &claimed.task;
        let now = self.clock.now();
        let retry_at = now + retry_delay(claimed.attempt);

        if let Err(e) = self
            .queue
            .fail(&task.transaction_reference, &err.to_string(), retry_at)
            .await
        {
            error!(
                transaction_reference = %task.transaction_reference,
                error = %e,
                "failed to record verification task failure"
            );
        }

        if claimed.is_last_attempt() {
            error!(
                transaction_reference = %task.transaction_reference,
                attempts = claimed.attempt,
                error = %err,
                "verification task abandoned"
            );
            self.audit
                .system(
                    ActionKind::VerificationAbandoned,
                    json!({
                        "transaction_reference": task.transaction_reference,
                        "order_id": task.order_id,
                        "attempts": claimed.attempt,
                        "error": err.to_string(),
                    }),
                )
                .await;
        } else {
            warn!(
                transaction_reference = %task.transaction_reference,
                attempt = claimed.attempt,
                retry_at = %retry_at,
                error = %err,
                "verification task failed"
            );
        }
    }

    #[instrument(skip(self, task), fields(transaction_reference = %task.transaction_reference, order_id = %task.order_id))]
    pub async fn process(&self, task: &VerificationTask) -> AppResult<TaskOutcome> {
        let now = self.clock.now();
        let stored = self
            .payments
            .insert_if_absent(&Payment::pending(task, now))
            .await?
            .into_inner();

        if stored.status.is_terminal() {
            if stored.status == PaymentStatus::Confirmed {
                self.resume_confirmation(&stored).await?;
            }
            debug!(status = stored.status.as_str(), "payment already settled");
            return Ok(TaskOutcome::AlreadySettled);
        }

        let order = self
            .orders
            .find_order(&stored.order_id)
            .await?
            .ok_or_else(|| AppError::UnknownOrder {
                order_id: stored.order_id.clone(),
            })?;

        let mut payout = self.machine.mark_intent(&order.order_number).await?;
        if payout.status == PayoutStatus::IntentMarked {
            payout = self.advance(&payout, PayoutStatus::ReceiptConfirmed).await?;
        }

        let difference = (stored.amount - order.total_amount).abs();
        if difference <= self.config.amount_tolerance {
            self.confirm(&stored, &order, &payout).await
        } else {
            self.reject(&stored, &order, &payout).await
        }
    }

    async fn confirm(&self, payment: &Payment, order: &Order, payout: &Payout) -> AppResult<TaskOutcome> {
        let now = self.clock.now();
        if !self
            .payments
            .mark_confirmed(&payment.transaction_reference, now)
            .await?
        {
            return Ok(TaskOutcome::LostRace);
        }

        self.settle_payout(payment, order, payout).await?;
        Ok(TaskOutcome::Confirmed)
    }

    /// `receipt_confirmed -> confirmed`, then issue the code and report the
    /// verification. Whichever attempt applies the transition does the rest.
    async fn settle_payout(&self, payment: &Payment, order: &Order, payout: &Payout) -> AppResult<()> {
        match self
            .machine
            .transition(payout, PayoutStatus::Confirmed, TransitionAuthority::VerificationWorker)
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {
                self.issuer.issue(order).await?;
                self.audit
                    .system(
                        ActionKind::PaymentVerified,
                        json!({
                            "transaction_reference": payment.transaction_reference,
                            "order_id": order.order_number,
                            "amount": payment.amount,
                        }),
                    )
                    .await;
                self.events.publish(DomainEvent::PaymentVerified {
                    order_id: order.order_number.clone(),
                    transaction_reference: payment.transaction_reference.clone(),
                });
                info!(order_id = %order.order_number, "payment verified, payout confirmed");
            }
            Ok(TransitionOutcome::Lost { current }) => {
                warn!(order_id = %order.order_number, current = %current, "payout moved before confirmation");
            }
            Err(TransitionError::Terminal { status, .. }) => {
                warn!(order_id = %order.order_number, status = %status, "payment confirmed for a settled payout");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn reject(&self, payment: &Payment, order: &Order, payout: &Payout) -> AppResult<TaskOutcome> {
        let now = self.clock.now();
        let mismatch = PaymentMismatch::open(
            &payment.transaction_reference,
            &order.order_number,
            order.total_amount,
            payment.amount,
            now,
        );

        if !self.payments.record_mismatch(&mismatch, now).await? {
            return Ok(TaskOutcome::LostRace);
        }

        warn!(
            order_id = %order.order_number,
            expected = %order.total_amount,
            received = %payment.amount,
            delta = %mismatch.delta,
            "payment amount does not match order"
        );

        self.audit
            .system(
                ActionKind::PaymentMismatch,
                json!({
                    "transaction_reference": payment.transaction_reference,
                    "order_id": order.order_number,
                    "expected_amount": order.total_amount,
                    "received_amount": payment.amount,
                    "delta": mismatch.delta,
                }),
            )
            .await;
        self.events.publish(DomainEvent::PaymentMismatch {
            order_id: order.order_number.clone(),
            transaction_reference: payment.transaction_reference.clone(),
            delta: mismatch.delta,
        });

        if self.config.fail_payout_on_mismatch {
            match self
                .machine
                .transition(
                    payout,
                    PayoutStatus::VerificationFailed,
                    TransitionAuthority::VerificationWorker,
                )
                .await
            {
                Ok(_) | Err(TransitionError::Terminal { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(TaskOutcome::Mismatched)
    }

    /// Apply `next`, or pick up whatever a concurrent writer left.
    async fn advance(&self, payout: &Payout, next: PayoutStatus) -> AppResult<Payout> {
        match self
            .machine
            .transition(payout, next, TransitionAuthority::VerificationWorker)
            .await?
        {
            TransitionOutcome::Applied(updated) => Ok(updated),
            TransitionOutcome::Lost { .. } => self
                .machine
                .find(&payout.order_id)
                .await?
                .ok_or_else(|| AppError::Internal(format!("payout for {} vanished", payout.order_id))),
        }
    }

    /// A retried task whose payment an earlier attempt already confirmed.
    /// That attempt may have failed before the payout moved, or after it
    /// moved but before the code was stored; finish whichever step is left.
    async fn resume_confirmation(&self, payment: &Payment) -> AppResult<()> {
        let Some(payout) = self.machine.find(&payment.order_id).await? else {
            warn!(order_id = %payment.order_id, "confirmed payment has no payout");
            return Ok(());
        };
        let Some(order) = self.orders.find_order(&payment.order_id).await? else {
            warn!(order_id = %payment.order_id, "confirmed payment references a missing order");
            return Ok(());
        };

        match payout.status {
            PayoutStatus::Confirmed => {
                self.issuer.issue(&order).await?;
            }
            PayoutStatus::IntentMarked => {
                let payout = self.advance(&payout, PayoutStatus::ReceiptConfirmed).await?;
                self.settle_payout(payment, &order, &payout).await?;
            }
            PayoutStatus::ReceiptConfirmed => {
                self.settle_payout(payment, &order, &payout).await?;
            }
            status => {
                debug!(status = %status, "payout already settled elsewhere");
            }
        }
        Ok(())
    }
}
