use crate::api::{source_address, AppState};
use crate::error::AppError;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Deserialize)]
pub struct VerifyDeliveryRequest {
    pub order_id: String,
    pub code: String,
    /// Courier or staff member presenting the code
    pub actor_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyDeliveryResponse {
    pub status: String,
    pub order_id: String,
}

/// `POST /deliveries/verify`
pub async fn verify_delivery(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<VerifyDeliveryRequest>,
) -> Result<Json<VerifyDeliveryResponse>, AppError> {
    let source = source_address(&headers, connect_info.as_ref());

    state
        .delivery
        .verify(
            &request.order_id,
            &request.code,
            request.actor_id.as_deref(),
            source.as_deref(),
        )
        .await?;

    Ok(Json(VerifyDeliveryResponse {
        status: "delivery_authorized".to_string(),
        order_id: request.order_id,
    }))
}
