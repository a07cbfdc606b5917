//! Application error taxonomy
//!
//! HTTP-facing failures map to a fixed JSON body with a machine-readable
//! `error` code. Storage failures are reported as `internal_error` without
//! detail; the cause goes to the log instead.

use crate::database::error::DatabaseError;
use crate::payments::normalizer::FieldErrors;
use crate::payments::signature::SignatureError;
use crate::payout::machine::TransitionError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("webhook signature rejected: {0}")]
    Authentication(#[from] SignatureError),

    #[error("payload failed validation: {errors}")]
    Validation { errors: FieldErrors },

    #[error("order {order_id} does not exist")]
    UnknownOrder { order_id: String },

    #[error("delivery code rejected: {reason}")]
    DeliveryRejected { reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<FieldErrors>,
}

impl AppError {
    pub fn validation(errors: FieldErrors) -> Self {
        AppError::Validation { errors }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::Validation { .. } | AppError::UnknownOrder { .. } => StatusCode::BAD_REQUEST,
            AppError::DeliveryRejected { .. } => StatusCode::FORBIDDEN,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Authentication(_) => "unauthenticated",
            AppError::Validation { .. } => "invalid_payload",
            AppError::UnknownOrder { .. } => "invalid_order",
            AppError::DeliveryRejected { .. } => "otp_rejected",
            AppError::Database(_) | AppError::Internal(_) => "internal_error",
        }
    }

    /// Only client-caused errors echo their message back.
    fn public_message(&self) -> String {
        match self {
            AppError::Authentication(_) => "Webhook signature is missing or invalid".to_string(),
            AppError::Validation { .. } => "Payload failed validation".to_string(),
            AppError::UnknownOrder { order_id } => format!("Order {} does not exist", order_id),
            AppError::DeliveryRejected { .. } => "Delivery code was not accepted".to_string(),
            _ => "An internal error occurred".to_string(),
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            status: "error",
            error: self.code(),
            message: self.public_message(),
            errors: match self {
                AppError::Validation { errors } => Some(errors.clone()),
                _ => None,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(self.body())).into_response()
    }
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::Database(e) => AppError::Database(e),
            other => AppError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::error::DatabaseErrorKind;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::from(SignatureError::Mismatch).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::UnknownOrder {
                order_id: "ORD-1".to_string()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::validation(FieldErrors::single("amount", "bad")).code(),
            "invalid_payload"
        );
    }

    #[test]
    fn test_internal_errors_do_not_leak_details() {
        let err = AppError::from(DatabaseError::new(DatabaseErrorKind::QueryError {
            message: "relation \"payouts\" does not exist".to_string(),
        }));
        let body = err.body();
        assert_eq!(body.error, "internal_error");
        assert!(!body.message.contains("payouts"));
    }
}
