//! Shared harness for the integration tests
//!
//! Wires the full pipeline over the in-memory stores and a manual clock, so
//! every test can drive the HTTP surface and the background jobs without
//! Postgres or Redis.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use http::{HeaderName, Request, StatusCode};
use payguard_backend::api::{self, AppState, HealthProbe};
use payguard_backend::audit::AuditLogger;
use payguard_backend::clock::{Clock, ManualClock};
use payguard_backend::config::DEFAULT_SIGNATURE_HEADER;
use payguard_backend::database::memory::{
    InMemoryAuditSink, InMemoryOrders, InMemoryOtps, InMemoryPayments, InMemoryPayouts,
    InMemoryTaskQueue, InMemoryWebhookLog,
};
use payguard_backend::database::repository::PayoutRepository;
use payguard_backend::events::EventBus;
use payguard_backend::lock::InMemoryJobLock;
use payguard_backend::notifications::{NotificationError, NotificationSink, OrderContext};
use payguard_backend::payments::signature::sign;
use payguard_backend::payments::{
    OrderCorrelator, SignatureVerifier, TaskQueue, VerificationTask, WebhookGateway,
};
use payguard_backend::payout::{
    DeliveryGate, OtpIssuer, PayoutStateMachine, ReaperConfig, StalePayoutReaper,
};
use payguard_backend::workers::{VerificationConfig, VerificationWorker};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower::ServiceExt;

pub const SECRET: &str = "whsec_integration_secret";
pub const PHONE: &str = "+260971234567";

#[derive(Debug, Clone, PartialEq)]
pub struct SentCode {
    pub phone: String,
    pub code: String,
    pub order_id: String,
}

/// Notification sink that remembers what it sent and can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentCode>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<SentCode> {
        self.sent.lock().await.clone()
    }

    pub async fn last_code(&self, order_id: &str) -> Option<String> {
        self.sent
            .lock()
            .await
            .iter()
            .rev()
            .find(|s| s.order_id == order_id)
            .map(|s| s.code.clone())
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn send_otp(
        &self,
        phone: &str,
        code: &str,
        order: &OrderContext,
    ) -> Result<(), NotificationError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotificationError::Unavailable {
                message: "sms gateway timed out".to_string(),
            });
        }
        self.sent.lock().await.push(SentCode {
            phone: phone.to_string(),
            code: code.to_string(),
            order_id: order.order_id.clone(),
        });
        Ok(())
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub orders: Arc<InMemoryOrders>,
    pub payments: Arc<InMemoryPayments>,
    pub payouts: Arc<InMemoryPayouts>,
    pub payout_store: Arc<dyn PayoutRepository>,
    pub otps: Arc<InMemoryOtps>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub webhook_log: Arc<InMemoryWebhookLog>,
    pub audit_sink: Arc<InMemoryAuditSink>,
    pub notifier: Arc<RecordingNotifier>,
    pub lock: Arc<InMemoryJobLock>,
    pub audit: AuditLogger,
    pub events: EventBus,
    pub machine: PayoutStateMachine,
    pub gateway: WebhookGateway,
    pub delivery: DeliveryGate,
    pub worker: Arc<VerificationWorker>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(VerificationConfig::default())
    }

    pub fn with_config(config: VerificationConfig) -> Self {
        Self::with_stores(
            config,
            |payouts| payouts as Arc<dyn PayoutRepository>,
            |queue| queue as Arc<dyn TaskQueue>,
        )
    }

    /// Build the pipeline over wrapped payout and queue stores. The harness
    /// keeps the inner in-memory stores for inspection.
    pub fn with_stores(
        config: VerificationConfig,
        wrap_payouts: impl FnOnce(Arc<InMemoryPayouts>) -> Arc<dyn PayoutRepository>,
        wrap_queue: impl FnOnce(Arc<InMemoryTaskQueue>) -> Arc<dyn TaskQueue>,
    ) -> Self {
        let clock = Arc::new(ManualClock::default());
        let orders = Arc::new(InMemoryOrders::new());
        let payments = Arc::new(InMemoryPayments::new());
        let payouts = Arc::new(InMemoryPayouts::new());
        let otps = Arc::new(InMemoryOtps::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let payout_store = wrap_payouts(payouts.clone());
        let queue_store = wrap_queue(queue.clone());
        let webhook_log = Arc::new(InMemoryWebhookLog::new());
        let audit_sink = Arc::new(InMemoryAuditSink::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let lock = Arc::new(InMemoryJobLock::new());

        let audit = AuditLogger::new(audit_sink.clone(), clock.clone());
        let events = EventBus::default();
        let machine = PayoutStateMachine::new(payout_store.clone(), audit.clone(), clock.clone());

        let gateway = WebhookGateway::new(
            "test-provider",
            SignatureVerifier::new(Some(SECRET.to_string()), false),
            OrderCorrelator::new(orders.clone()),
            machine.clone(),
            queue_store.clone(),
            webhook_log.clone(),
            audit.clone(),
            events.clone(),
            clock.clone(),
        );
        let delivery = DeliveryGate::new(otps.clone(), payout_store.clone(), audit.clone(), clock.clone());
        let issuer = OtpIssuer::new(otps.clone(), notifier.clone(), audit.clone(), clock.clone());

        let worker = Arc::new(VerificationWorker::new(
            payments.clone(),
            orders.clone(),
            queue_store,
            machine.clone(),
            issuer,
            audit.clone(),
            events.clone(),
            clock.clone(),
            config,
        ));

        Self {
            clock,
            orders,
            payments,
            payouts,
            payout_store,
            otps,
            queue,
            webhook_log,
            audit_sink,
            notifier,
            lock,
            audit,
            events,
            machine,
            gateway,
            delivery,
            worker,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn router(&self) -> Router {
        api::router(AppState {
            gateway: self.gateway.clone(),
            delivery: self.delivery.clone(),
            signature_header: HeaderName::from_static(DEFAULT_SIGNATURE_HEADER),
            health: HealthProbe {
                environment: "test".to_string(),
                ..HealthProbe::default()
            },
        })
    }

    /// A reaper over this harness's stores, sharing its lease.
    pub fn reaper(&self, config: ReaperConfig) -> StalePayoutReaper {
        StalePayoutReaper::new(
            self.machine.clone(),
            self.payout_store.clone(),
            self.audit.clone(),
            self.events.clone(),
            self.lock.clone(),
            self.clock.clone(),
            config,
        )
    }

    pub async fn seed_order(&self, order_id: &str, total: Decimal) {
        self.orders.insert_order(order_id, total, PHONE).await;
    }

    /// Post `payload` signed with the shared secret.
    pub async fn post_signed(&self, payload: &Value) -> (StatusCode, Value) {
        let body = serde_json::to_vec(payload).unwrap();
        let signature = sign(SECRET, &body);
        self.post_webhook(body, Some(signature)).await
    }

    pub async fn post_webhook(&self, body: Vec<u8>, signature: Option<String>) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri("/webhooks/payments")
            .header("content-type", "application/json")
            .header("x-forwarded-for", "198.51.100.20");
        if let Some(signature) = signature {
            request = request.header(DEFAULT_SIGNATURE_HEADER, signature);
        }
        send(self.router(), request.body(Body::from(body)).unwrap()).await
    }

    pub async fn verify_delivery(&self, order_id: &str, code: &str) -> (StatusCode, Value) {
        let body = json!({ "order_id": order_id, "code": code, "actor_id": "courier-7" });
        let request = Request::builder()
            .method("POST")
            .uri("/deliveries/verify")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(self.router(), request).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        send(self.router(), request).await
    }

    pub async fn enqueue(&self, task: &VerificationTask) {
        self.queue.enqueue(task).await.unwrap();
    }
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

/// Flat-shape webhook payload.
pub fn flat_payload(order_id: &str, reference: &str, amount: Decimal, status: &str) -> Value {
    json!({
        "amount": amount.to_string(),
        "transaction_reference": reference,
        "order_id": order_id,
        "customer_phone": PHONE,
        "payment_date": "2026-03-01T10:15:00Z",
        "status": status,
    })
}

pub fn task(order_id: &str, reference: &str, amount: Decimal) -> VerificationTask {
    VerificationTask {
        amount,
        transaction_reference: reference.to_string(),
        order_id: order_id.to_string(),
        customer_phone: PHONE.to_string(),
        payment_date: Utc::now() - Duration::minutes(1),
        raw_payload: json!({ "transaction_reference": reference }),
    }
}
