//! HTTP surface

pub mod delivery;
pub mod health;
pub mod webhook;

use crate::payments::gateway::WebhookGateway;
use crate::payout::delivery::DeliveryGate;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderName};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub use health::HealthProbe;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub gateway: WebhookGateway,
    pub delivery: DeliveryGate,
    pub signature_header: HeaderName,
    pub health: HealthProbe,
}

pub fn router(state: AppState) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/webhooks/payments", post(webhook::receive_payment_webhook))
        .route("/deliveries/verify", post(delivery::verify_delivery))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id)),
        )
        .with_state(state)
}

/// Client address, preferring what the load balancer reports.
pub(crate) fn source_address(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()))
}
