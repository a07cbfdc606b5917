mod common;

use common::{flat_payload, Harness, SECRET};
use http::StatusCode;
use payguard_backend::audit::ActionKind;
use payguard_backend::database::repository::{OtpRepository, PaymentRepository, PayoutRepository};
use payguard_backend::payments::signature::sign;
use payguard_backend::payments::types::PaymentStatus;
use payguard_backend::payout::PayoutStatus;
use rust_decimal_macros::dec;
use serde_json::json;

#[tokio::test]
async fn test_signed_payment_flows_through_to_delivery() {
    let h = Harness::new();
    h.seed_order("ORD-100", dec!(5000)).await;

    let (status, body) = h
        .post_signed(&flat_payload("ORD-100", "TX-1", dec!(5000), "successful"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "status": "processed",
            "order_id": "ORD-100",
            "transaction_reference": "TX-1",
            "duplicate": false,
        })
    );

    let payout = h.payouts.find_by_order("ORD-100").await.unwrap().unwrap();
    assert_eq!(payout.status, PayoutStatus::IntentMarked);
    assert_eq!(h.queue.len().await, 1);
    assert_eq!(h.audit_sink.count(ActionKind::PaymentQueued).await, 1);

    assert_eq!(h.worker.run_cycle().await.unwrap(), 1);

    let payment = h.payments.find_by_reference("TX-1").await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Confirmed);
    assert!(payment.verified_at.is_some());
    let payout = h.payouts.find_by_order("ORD-100").await.unwrap().unwrap();
    assert_eq!(payout.status, PayoutStatus::Confirmed);
    assert_eq!(h.audit_sink.count(ActionKind::PaymentVerified).await, 1);
    assert_eq!(h.queue.outstanding().await, 0);

    let code = h.notifier.last_code("ORD-100").await.unwrap();
    let otp = h.otps.find_by_order("ORD-100").await.unwrap().unwrap();
    assert_eq!(otp.code, code);
    assert!(otp.dispatched_at.is_some());

    let (status, body) = h.verify_delivery("ORD-100", &code).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "delivery_authorized");

    let (status, body) = h.verify_delivery("ORD-100", &code).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "otp_rejected");
}

#[tokio::test]
async fn test_provider_envelope_is_accepted() {
    let h = Harness::new();
    h.seed_order("ORD-100", dec!(5000)).await;

    let payload = json!({
        "event": "charge.success",
        "data": {
            "amount": 5000,
            "reference": "TX-9",
            "status": "success",
            "paid_at": "2026-03-01T10:15:00Z",
            "customer": { "phone": common::PHONE },
            "metadata": { "order_id": "ORD-100" }
        }
    });

    let (status, body) = h.post_signed(&payload).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "processed");
    assert_eq!(body["transaction_reference"], "TX-9");
}

#[tokio::test]
async fn test_tampered_body_is_rejected() {
    let h = Harness::new();
    h.seed_order("ORD-100", dec!(5000)).await;

    let original = serde_json::to_vec(&flat_payload("ORD-100", "TX-1", dec!(50), "successful")).unwrap();
    let signature = sign(SECRET, &original);
    let tampered =
        serde_json::to_vec(&flat_payload("ORD-100", "TX-1", dec!(5000), "successful")).unwrap();

    let (status, body) = h.post_webhook(tampered, Some(signature)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthenticated");

    assert!(h.queue.is_empty().await);
    assert!(h.payouts.find_by_order("ORD-100").await.unwrap().is_none());
    assert_eq!(h.audit_sink.count(ActionKind::WebhookSignatureInvalid).await, 1);

    // The raw attempt is kept even though it was rejected
    let attempts = h.webhook_log.attempts().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].source_address.as_deref(), Some("198.51.100.20"));
}

#[tokio::test]
async fn test_missing_signature_is_rejected() {
    let h = Harness::new();
    h.seed_order("ORD-100", dec!(5000)).await;

    let body = serde_json::to_vec(&flat_payload("ORD-100", "TX-1", dec!(5000), "successful")).unwrap();
    let (status, _) = h.post_webhook(body, None).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn test_unknown_order_raises_single_fraud_alert() {
    let h = Harness::new();

    let (status, body) = h
        .post_signed(&flat_payload("ORD-404", "TX-2", dec!(5000), "successful"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_order");

    assert_eq!(h.audit_sink.critical_count().await, 1);
    let entries = h.audit_sink.entries().await;
    let fraud = entries
        .iter()
        .find(|e| e.action == ActionKind::FraudAttempt)
        .unwrap();
    assert_eq!(fraud.context["order_id"], "ORD-404");
    assert_eq!(fraud.source_address.as_deref(), Some("198.51.100.20"));

    assert!(h.queue.is_empty().await);
    assert!(h.payouts.find_by_order("ORD-404").await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_successful_status_is_acknowledged_only() {
    let h = Harness::new();
    h.seed_order("ORD-100", dec!(5000)).await;

    let (status, body) = h
        .post_signed(&flat_payload("ORD-100", "TX-3", dec!(5000), "pending"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "acknowledged");
    assert_eq!(body["payment_status"], "pending");

    assert!(h.queue.is_empty().await);
    assert!(h.payouts.find_by_order("ORD-100").await.unwrap().is_none());
    assert_eq!(h.audit_sink.count(ActionKind::WebhookAcknowledged).await, 1);
}

#[tokio::test]
async fn test_duplicate_delivery_is_queued_once() {
    let h = Harness::new();
    h.seed_order("ORD-100", dec!(5000)).await;
    let payload = flat_payload("ORD-100", "TX-1", dec!(5000), "successful");

    let (_, first) = h.post_signed(&payload).await;
    let (status, second) = h.post_signed(&payload).await;

    assert_eq!(first["duplicate"], false);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["duplicate"], true);
    assert_eq!(h.queue.len().await, 1);
    assert_eq!(h.audit_sink.count(ActionKind::PaymentQueued).await, 1);
    assert_eq!(h.webhook_log.attempts().await.len(), 2);

    h.worker.run_cycle().await.unwrap();
    assert_eq!(h.payments.count().await, 1);
    assert_eq!(h.otps.count().await, 1);
}

#[tokio::test]
async fn test_invalid_fields_are_reported_together() {
    let h = Harness::new();
    h.seed_order("ORD-100", dec!(5000)).await;

    let payload = json!({
        "amount": "-5",
        "transaction_reference": "TX-4",
        "order_id": "ORD-100",
        "customer_phone": "",
        "payment_date": "yesterday",
        "status": "successful",
    });

    let (status, body) = h.post_signed(&payload).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_payload");
    assert!(body["errors"]["amount"].is_array());
    assert!(body["errors"]["customer_phone"].is_array());
    assert!(body["errors"]["payment_date"].is_array());

    assert!(h.queue.is_empty().await);
    assert_eq!(h.audit_sink.count(ActionKind::WebhookValidationFailed).await, 1);
}

#[tokio::test]
async fn test_non_json_body_is_a_validation_error() {
    let h = Harness::new();
    let body = b"not json".to_vec();
    let signature = sign(SECRET, &body);

    let (status, response) = h.post_webhook(body, Some(signature)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response["errors"]["payload"].is_array());
}

#[tokio::test]
async fn test_health_reports_unconfigured_backends() {
    let h = Harness::new();

    let (status, body) = h.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["environment"], "test");
    assert_eq!(body["database"], "not_configured");
    assert_eq!(body["redis"], "not_configured");
}
