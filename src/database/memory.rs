//! In-memory stores
//!
//! Same contracts as the Postgres repositories, including the unique keys and
//! compare-and-set semantics, so the pipeline can run without a database in
//! tests and local development.

use crate::audit::{ActionKind, AuditEntry, AuditSink, Severity};
use crate::database::error::{DatabaseError, DbResult};
use crate::database::repository::{
    OtpRepository, PaymentRepository, PayoutRepository, WebhookLogRepository,
};
use crate::payments::traits::{ClaimedTask, OrderLookup, TaskQueue, MAX_TASK_ATTEMPTS};
use crate::payments::types::{
    InsertOutcome, Order, Payment, PaymentMismatch, PaymentStatus, RawWebhookAttempt,
    VerificationTask,
};
use crate::payout::delivery::DeliveryOtp;
use crate::payout::state::{Payout, PayoutStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default, Clone)]
pub struct InMemoryOrders {
    orders: Arc<RwLock<HashMap<String, Order>>>,
}

impl InMemoryOrders {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, order: Order) {
        self.orders
            .write()
            .await
            .insert(order.order_number.clone(), order);
    }

    /// Shorthand for a pending order with no delivery address.
    pub async fn insert_order(&self, order_number: &str, total_amount: Decimal, customer_phone: &str) {
        self.insert(Order {
            order_number: order_number.to_string(),
            total_amount,
            customer_phone: customer_phone.to_string(),
            delivery_address: None,
            status: "pending".to_string(),
        })
        .await;
    }

    pub async fn remove(&self, order_number: &str) {
        self.orders.write().await.remove(order_number);
    }
}

#[async_trait]
impl OrderLookup for InMemoryOrders {
    async fn find_order(&self, order_number: &str) -> DbResult<Option<Order>> {
        Ok(self.orders.read().await.get(order_number).cloned())
    }
}

#[derive(Default)]
struct PaymentState {
    payments: HashMap<String, Payment>,
    mismatches: Vec<PaymentMismatch>,
}

#[derive(Default, Clone)]
pub struct InMemoryPayments {
    state: Arc<RwLock<PaymentState>>,
}

impl InMemoryPayments {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.payments.len()
    }

    pub async fn mismatch_count(&self) -> usize {
        self.state.read().await.mismatches.len()
    }
}

#[async_trait]
impl PaymentRepository for InMemoryPayments {
    async fn insert_if_absent(&self, payment: &Payment) -> DbResult<InsertOutcome<Payment>> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.payments.get(&payment.transaction_reference) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        state
            .payments
            .insert(payment.transaction_reference.clone(), payment.clone());
        Ok(InsertOutcome::Created(payment.clone()))
    }

    async fn find_by_reference(&self, reference: &str) -> DbResult<Option<Payment>> {
        Ok(self.state.read().await.payments.get(reference).cloned())
    }

    async fn mark_confirmed(&self, reference: &str, verified_at: DateTime<Utc>) -> DbResult<bool> {
        let mut state = self.state.write().await;
        match state.payments.get_mut(reference) {
            Some(p) if p.status == PaymentStatus::Pending => {
                p.status = PaymentStatus::Confirmed;
                p.verified_at = Some(verified_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_mismatch(
        &self,
        mismatch: &PaymentMismatch,
        verified_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut state = self.state.write().await;
        match state.payments.get_mut(&mismatch.transaction_reference) {
            Some(p) if p.status == PaymentStatus::Pending => {
                p.status = PaymentStatus::VerificationFailed;
                p.verified_at = Some(verified_at);
            }
            _ => return Ok(false),
        }
        state.mismatches.push(mismatch.clone());
        Ok(true)
    }

    async fn mismatches_for_order(&self, order_id: &str) -> DbResult<Vec<PaymentMismatch>> {
        let state = self.state.read().await;
        Ok(state
            .mismatches
            .iter()
            .filter(|m| m.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryPayouts {
    payouts: Arc<RwLock<HashMap<String, Payout>>>,
}

impl InMemoryPayouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a payout as-is, e.g. one backdated for staleness tests.
    pub async fn insert(&self, payout: Payout) {
        self.payouts
            .write()
            .await
            .insert(payout.order_id.clone(), payout);
    }
}

#[async_trait]
impl PayoutRepository for InMemoryPayouts {
    async fn mark_intent(&self, order_id: &str, now: DateTime<Utc>) -> DbResult<InsertOutcome<Payout>> {
        let mut payouts = self.payouts.write().await;
        if let Some(existing) = payouts.get(order_id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        let payout = Payout::intent(order_id, now);
        payouts.insert(order_id.to_string(), payout.clone());
        Ok(InsertOutcome::Created(payout))
    }

    async fn find_by_order(&self, order_id: &str) -> DbResult<Option<Payout>> {
        Ok(self.payouts.read().await.get(order_id).cloned())
    }

    async fn compare_and_set(
        &self,
        payout_id: Uuid,
        expected: PayoutStatus,
        next: PayoutStatus,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut payouts = self.payouts.write().await;
        match payouts.values_mut().find(|p| p.id == payout_id) {
            Some(p) if p.status == expected => {
                p.status = next;
                p.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stale(
        &self,
        statuses: &[PayoutStatus],
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Payout>> {
        let payouts = self.payouts.read().await;
        let mut stale: Vec<Payout> = payouts
            .values()
            .filter(|p| statuses.contains(&p.status) && p.created_at < created_before)
            .cloned()
            .collect();
        stale.sort_by_key(|p| p.created_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

#[derive(Default, Clone)]
pub struct InMemoryOtps {
    otps: Arc<RwLock<HashMap<String, DeliveryOtp>>>,
}

impl InMemoryOtps {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.otps.read().await.len()
    }
}

#[async_trait]
impl OtpRepository for InMemoryOtps {
    async fn issue(&self, otp: &DeliveryOtp) -> DbResult<InsertOutcome<DeliveryOtp>> {
        let mut otps = self.otps.write().await;
        if let Some(existing) = otps.get(&otp.order_id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        otps.insert(otp.order_id.clone(), otp.clone());
        Ok(InsertOutcome::Created(otp.clone()))
    }

    async fn find_by_order(&self, order_id: &str) -> DbResult<Option<DeliveryOtp>> {
        Ok(self.otps.read().await.get(order_id).cloned())
    }

    async fn consume(&self, otp_id: Uuid, now: DateTime<Utc>) -> DbResult<bool> {
        let mut otps = self.otps.write().await;
        match otps.values_mut().find(|o| o.id == otp_id) {
            Some(o) if o.consumed_at.is_none() => {
                o.consumed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failed_attempt(&self, otp_id: Uuid) -> DbResult<i32> {
        let mut otps = self.otps.write().await;
        match otps.values_mut().find(|o| o.id == otp_id) {
            Some(o) => {
                o.failed_attempts += 1;
                Ok(o.failed_attempts)
            }
            None => Err(DatabaseError::not_found("delivery otp", otp_id.to_string())),
        }
    }

    async fn mark_dispatched(&self, otp_id: Uuid, now: DateTime<Utc>) -> DbResult<()> {
        let mut otps = self.otps.write().await;
        if let Some(o) = otps.values_mut().find(|o| o.id == otp_id) {
            o.dispatched_at = Some(now);
        }
        Ok(())
    }

    async fn pending_dispatch(&self, limit: i64) -> DbResult<Vec<DeliveryOtp>> {
        let otps = self.otps.read().await;
        let mut pending: Vec<DeliveryOtp> = otps
            .values()
            .filter(|o| o.dispatched_at.is_none() && o.consumed_at.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|o| o.created_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }
}

#[derive(Debug, Clone)]
struct QueuedTask {
    task: VerificationTask,
    attempts: i32,
    last_error: Option<String>,
    available_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

/// FIFO task queue keyed by transaction reference.
#[derive(Default, Clone)]
pub struct InMemoryTaskQueue {
    tasks: Arc<RwLock<Vec<QueuedTask>>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Tasks neither completed nor out of attempts.
    pub async fn outstanding(&self) -> usize {
        self.tasks
            .read()
            .await
            .iter()
            .filter(|t| t.completed_at.is_none() && t.attempts < MAX_TASK_ATTEMPTS)
            .count()
    }

    pub async fn last_error(&self, transaction_reference: &str) -> Option<String> {
        self.tasks
            .read()
            .await
            .iter()
            .find(|t| t.task.transaction_reference == transaction_reference)
            .and_then(|t| t.last_error.clone())
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: &VerificationTask) -> DbResult<bool> {
        let mut tasks = self.tasks.write().await;
        if tasks
            .iter()
            .any(|t| t.task.transaction_reference == task.transaction_reference)
        {
            return Ok(false);
        }
        tasks.push(QueuedTask {
            task: task.clone(),
            attempts: 0,
            last_error: None,
            available_at: None,
            claimed_at: None,
            completed_at: None,
        });
        Ok(true)
    }

    async fn claim(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> DbResult<Vec<ClaimedTask>> {
        let mut tasks = self.tasks.write().await;
        let mut claimed = Vec::new();
        for queued in tasks.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            let runnable = queued.completed_at.is_none()
                && queued.attempts < MAX_TASK_ATTEMPTS
                && queued.available_at.map(|at| at <= now).unwrap_or(true)
                && queued.claimed_at.map(|at| at + lease <= now).unwrap_or(true);
            if runnable {
                queued.attempts += 1;
                queued.claimed_at = Some(now);
                claimed.push(ClaimedTask {
                    task: queued.task.clone(),
                    attempt: queued.attempts,
                });
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, transaction_reference: &str, now: DateTime<Utc>) -> DbResult<()> {
        let mut tasks = self.tasks.write().await;
        if let Some(t) = tasks
            .iter_mut()
            .find(|t| t.task.transaction_reference == transaction_reference)
        {
            t.completed_at = Some(now);
        }
        Ok(())
    }

    async fn fail(
        &self,
        transaction_reference: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let mut tasks = self.tasks.write().await;
        if let Some(t) = tasks
            .iter_mut()
            .find(|t| t.task.transaction_reference == transaction_reference)
        {
            t.last_error = Some(error.to_string());
            t.available_at = Some(retry_at);
            t.claimed_at = None;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryWebhookLog {
    attempts: Arc<RwLock<Vec<RawWebhookAttempt>>>,
}

impl InMemoryWebhookLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attempts(&self) -> Vec<RawWebhookAttempt> {
        self.attempts.read().await.clone()
    }
}

#[async_trait]
impl WebhookLogRepository for InMemoryWebhookLog {
    async fn log_attempt(&self, attempt: &RawWebhookAttempt) -> DbResult<()> {
        self.attempts.write().await.push(attempt.clone());
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryAuditSink {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    pub async fn count(&self, action: ActionKind) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.action == action)
            .count()
    }

    pub async fn critical_count(&self) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.severity == Severity::Critical)
            .count()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, entry: &AuditEntry) -> DbResult<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }
}
