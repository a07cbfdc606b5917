//! HTTP notification gateway client
//!
//! Posts delivery codes to an SMS/WhatsApp gateway that picks the channel.
//! Retries 429 and 5xx responses with exponential backoff.

use super::{mask_phone, NotificationError, NotificationSink, OrderContext};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info, warn};

/// Notification gateway configuration
#[derive(Debug, Clone)]
pub struct HttpNotificationConfig {
    /// Endpoint that accepts `{to, message, reference}` JSON
    pub url: String,
    /// Bearer token for the gateway
    pub api_key: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum number of retries for failed requests
    pub max_retries: u32,
}

impl Default for HttpNotificationConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            timeout_secs: 10,
            max_retries: 3,
        }
    }
}

pub struct HttpNotificationSink {
    config: HttpNotificationConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    message: Option<String>,
}

impl HttpNotificationSink {
    pub fn new(config: HttpNotificationConfig) -> Result<Self, NotificationError> {
        if config.url.trim().is_empty() {
            return Err(NotificationError::Config {
                message: "notification gateway URL is empty".to_string(),
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NotificationError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self { config, client })
    }

    fn render_message(code: &str, order: &OrderContext) -> String {
        match &order.delivery_address {
            Some(address) => format!(
                "Your delivery code for order {} is {}. Share it with the courier at {} only on handover.",
                order.order_id, code, address
            ),
            None => format!(
                "Your delivery code for order {} is {}. Share it with the courier only on handover.",
                order.order_id, code
            ),
        }
    }

    async fn post_with_retry(&self, body: &serde_json::Value) -> Result<(), NotificationError> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            let result = self
                .client
                .post(&self.config.url)
                .bearer_auth(&self.config.api_key)
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }

                    let text = response.text().await.unwrap_or_default();
                    let message = serde_json::from_str::<GatewayResponse>(&text)
                        .ok()
                        .and_then(|r| r.message)
                        .unwrap_or_else(|| format!("HTTP {}", status));

                    if status.as_u16() == 429 {
                        last_error = Some(NotificationError::RateLimited);
                    } else if status.is_server_error() {
                        last_error = Some(NotificationError::Unavailable { message });
                    } else {
                        error!("Notification gateway rejected request: {}", message);
                        return Err(NotificationError::Rejected { message });
                    }
                }
                Err(e) => {
                    last_error = Some(NotificationError::Unavailable {
                        message: e.to_string(),
                    });
                }
            }

            if attempt < self.config.max_retries {
                let backoff = 2_u64.pow(attempt);
                warn!(
                    "Notification attempt {} failed, retrying after {} seconds",
                    attempt + 1,
                    backoff
                );
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
        }

        Err(last_error.unwrap_or(NotificationError::Unavailable {
            message: format!("request failed after {} retries", self.config.max_retries),
        }))
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn send_otp(
        &self,
        phone: &str,
        code: &str,
        order: &OrderContext,
    ) -> Result<(), NotificationError> {
        let body = serde_json::json!({
            "to": phone,
            "message": Self::render_message(code, order),
            "reference": format!("otp-{}", order.order_id),
        });

        self.post_with_retry(&body).await?;

        info!(
            order_id = %order.order_id,
            phone = %mask_phone(phone),
            "delivery code dispatched"
        );
        Ok(())
    }
}
