//! Webhook gateway
//!
//! Composes the inbound pipeline. Each step is a hard gate: the raw attempt is
//! logged, then the signature, the payload fields, the order and the reported
//! status must all pass before a verification task is queued. Nothing here
//! waits on verification itself.

use crate::audit::{ActionKind, AuditLogger};
use crate::clock::Clock;
use crate::database::repository::WebhookLogRepository;
use crate::error::{AppError, AppResult};
use crate::events::{DomainEvent, EventBus};
use crate::payments::correlator::OrderCorrelator;
use crate::payments::normalizer::{self, FieldErrors};
use crate::payments::signature::{SignatureCheck, SignatureVerifier};
use crate::payments::traits::TaskQueue;
use crate::payments::types::{NotificationStatus, RawWebhookAttempt, VerificationTask};
use crate::payout::machine::PayoutStateMachine;
use axum::body::Bytes;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// A webhook exactly as it arrived.
#[derive(Debug, Clone)]
pub struct InboundWebhook {
    pub body: Bytes,
    pub signature: Option<String>,
    pub headers: Value,
    pub source_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GatewayResponse {
    Processed {
        order_id: String,
        transaction_reference: String,
        /// The reference was already queued by an earlier delivery.
        duplicate: bool,
    },
    Acknowledged {
        transaction_reference: String,
        payment_status: NotificationStatus,
    },
}

#[derive(Clone)]
pub struct WebhookGateway {
    source: String,
    verifier: SignatureVerifier,
    correlator: OrderCorrelator,
    machine: PayoutStateMachine,
    queue: Arc<dyn TaskQueue>,
    webhook_log: Arc<dyn WebhookLogRepository>,
    audit: AuditLogger,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl WebhookGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: impl Into<String>,
        verifier: SignatureVerifier,
        correlator: OrderCorrelator,
        machine: PayoutStateMachine,
        queue: Arc<dyn TaskQueue>,
        webhook_log: Arc<dyn WebhookLogRepository>,
        audit: AuditLogger,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source: source.into(),
            verifier,
            correlator,
            machine,
            queue,
            webhook_log,
            audit,
            events,
            clock,
        }
    }

    #[instrument(skip(self, webhook), fields(source_address = ?webhook.source_address))]
    pub async fn handle(&self, webhook: InboundWebhook) -> AppResult<GatewayResponse> {
        let parsed: Result<Value, _> = serde_json::from_slice(&webhook.body);
        self.log_raw(&webhook, parsed.as_ref().ok()).await;

        let source = webhook.source_address.as_deref();

        match self
            .verifier
            .verify(&webhook.body, webhook.signature.as_deref())
        {
            Ok(SignatureCheck::Verified) => {}
            Ok(SignatureCheck::Skipped) => {
                warn!("accepting unsigned webhook, no signing secret configured");
            }
            Err(e) => {
                self.audit
                    .record(
                        ActionKind::WebhookSignatureInvalid,
                        None,
                        source,
                        json!({ "reason": e.to_string() }),
                    )
                    .await;
                return Err(AppError::Authentication(e));
            }
        }

        let payload = match parsed {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "webhook body is not JSON");
                let errors = FieldErrors::single("payload", "body is not valid JSON");
                return Err(self.reject_payload(errors, source).await);
            }
        };

        let normalized = normalizer::normalize(&payload);
        let payment = match normalizer::validate(&normalized) {
            Ok(payment) => payment,
            Err(errors) => return Err(self.reject_payload(errors, source).await),
        };

        let order = match self.correlator.correlate(&payment).await {
            Ok(order) => order,
            Err(AppError::UnknownOrder { order_id }) => {
                self.audit
                    .record(
                        ActionKind::FraudAttempt,
                        None,
                        source,
                        json!({
                            "transaction_reference": payment.transaction_reference,
                            "order_id": order_id,
                            "amount": payment.amount,
                            "customer_phone": payment.customer_phone,
                        }),
                    )
                    .await;
                return Err(AppError::UnknownOrder { order_id });
            }
            Err(e) => return Err(e),
        };

        if payment.status != NotificationStatus::Successful {
            self.audit
                .record(
                    ActionKind::WebhookAcknowledged,
                    None,
                    source,
                    json!({
                        "transaction_reference": payment.transaction_reference,
                        "order_id": order.order_number,
                        "status": payment.status.as_str(),
                    }),
                )
                .await;
            return Ok(GatewayResponse::Acknowledged {
                transaction_reference: payment.transaction_reference,
                payment_status: payment.status,
            });
        }

        self.machine.mark_intent(&order.order_number).await?;

        let task = VerificationTask::from_payment(&payment, payload);
        let created = self.queue.enqueue(&task).await?;

        if created {
            self.events.publish(DomainEvent::OrderReceived {
                order_id: order.order_number.clone(),
                transaction_reference: payment.transaction_reference.clone(),
                amount: payment.amount,
            });
            self.audit
                .record(
                    ActionKind::PaymentQueued,
                    None,
                    source,
                    json!({
                        "transaction_reference": payment.transaction_reference,
                        "order_id": order.order_number,
                        "amount": payment.amount,
                    }),
                )
                .await;
        } else {
            debug!(
                transaction_reference = %payment.transaction_reference,
                "duplicate webhook delivery, task already queued"
            );
        }

        Ok(GatewayResponse::Processed {
            order_id: order.order_number,
            transaction_reference: payment.transaction_reference,
            duplicate: !created,
        })
    }

    async fn log_raw(&self, webhook: &InboundWebhook, parsed: Option<&Value>) {
        let payload = match parsed {
            Some(value) => value.clone(),
            None => Value::String(String::from_utf8_lossy(&webhook.body).into_owned()),
        };

        let attempt = RawWebhookAttempt {
            id: Uuid::new_v4(),
            source: self.source.clone(),
            source_address: webhook.source_address.clone(),
            headers: webhook.headers.clone(),
            payload,
            received_at: self.clock.now(),
        };

        if let Err(e) = self.webhook_log.log_attempt(&attempt).await {
            warn!(
                error = %e,
                retryable = e.is_retryable(),
                "failed to write raw webhook log, continuing"
            );
        }
    }

    async fn reject_payload(&self, errors: FieldErrors, source: Option<&str>) -> AppError {
        self.audit
            .record(
                ActionKind::WebhookValidationFailed,
                None,
                source,
                json!({ "error_count": errors.len(), "errors": errors }),
            )
            .await;
        AppError::validation(errors)
    }
}
