//! Outbound customer notifications
//!
//! The core only needs to hand a delivery code to "something that reaches the
//! customer". Channel selection lives behind [`NotificationSink`].

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpNotificationConfig, HttpNotificationSink};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification gateway rejected request: {message}")]
    Rejected { message: String },

    #[error("notification gateway unavailable: {message}")]
    Unavailable { message: String },

    #[error("rate limited by notification gateway")]
    RateLimited,

    #[error("notification configuration error: {message}")]
    Config { message: String },
}

impl NotificationError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NotificationError::Unavailable { .. } | NotificationError::RateLimited
        )
    }
}

/// Context shown to the customer alongside the code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderContext {
    pub order_id: String,
    pub delivery_address: Option<String>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_otp(
        &self,
        phone: &str,
        code: &str,
        order: &OrderContext,
    ) -> Result<(), NotificationError>;
}

/// Sink that only logs. Used when no gateway is configured outside production.
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn send_otp(
        &self,
        phone: &str,
        _code: &str,
        order: &OrderContext,
    ) -> Result<(), NotificationError> {
        tracing::info!(
            order_id = %order.order_id,
            phone = %mask_phone(phone),
            "delivery code generated (no notification gateway configured)"
        );
        Ok(())
    }
}

/// Keep the last four digits for log lines.
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), visible)
}
