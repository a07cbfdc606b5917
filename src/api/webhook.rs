use crate::api::{source_address, AppState};
use crate::error::AppError;
use crate::payments::gateway::{GatewayResponse, InboundWebhook};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{Map, Value};
use std::net::SocketAddr;

const REDACTED_HEADERS: [&str; 2] = ["authorization", "cookie"];

/// `POST /webhooks/payments`
///
/// The body is taken as raw bytes so the signature is checked against exactly
/// what the provider signed.
pub async fn receive_payment_webhook(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<GatewayResponse>, AppError> {
    let signature = headers
        .get(&state.signature_header)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let webhook = InboundWebhook {
        body,
        signature,
        headers: headers_to_json(&headers),
        source_address: source_address(&headers, connect_info.as_ref()),
    };

    state.gateway.handle(webhook).await.map(Json)
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        let value = if REDACTED_HEADERS.contains(&name.as_str()) {
            "<redacted>".to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        map.insert(name.as_str().to_string(), Value::String(value));
    }
    Value::Object(map)
}
