use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::api::AppState;
use crate::database;

#[cfg(feature = "cache")]
use crate::cache::{self, RedisPool};

/// What `/health` checks. Missing backends report `not_configured`.
#[derive(Clone, Default)]
pub struct HealthProbe {
    pub environment: String,
    pub database: Option<PgPool>,
    #[cfg(feature = "cache")]
    pub redis: Option<RedisPool>,
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub database: String,
    pub redis: String,
}

fn describe(result: Option<bool>) -> String {
    match result {
        Some(true) => "up",
        Some(false) => "down",
        None => "not_configured",
    }
    .to_string()
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let probe = &state.health;

    let database = match &probe.database {
        Some(pool) => Some(database::health_check(pool).await.is_ok()),
        None => None,
    };

    #[cfg(feature = "cache")]
    let redis = match &probe.redis {
        Some(pool) => Some(cache::health_check(pool).await.is_ok()),
        None => None,
    };
    #[cfg(not(feature = "cache"))]
    let redis: Option<bool> = None;

    let healthy = database != Some(false) && redis != Some(false);

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: probe.environment.clone(),
        database: describe(database),
        redis: describe(redis),
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
