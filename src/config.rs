use crate::notifications::HttpNotificationConfig;
use crate::payout::reaper::ReaperConfig;
use crate::workers::verification_worker::VerificationConfig;
use anyhow::{anyhow, Context, Result};
use axum::http::HeaderName;
use std::env;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_SIGNATURE_HEADER: &str = "x-payment-signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            other => Err(anyhow!(
                "Environment must be one of: development, staging, production, got {}",
                other
            )),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub webhook: WebhookConfig,
    pub verification: VerificationConfig,
    pub reaper: ReaperConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Without Redis the reaper lease is process-local.
    pub url: Option<String>,
}

#[derive(Clone)]
pub struct WebhookConfig {
    pub secret: Option<String>,
    pub signature_header: String,
    /// Only honoured outside production.
    pub allow_unsigned: bool,
    /// Label stored with each raw attempt.
    pub source: String,
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("signature_header", &self.signature_header)
            .field("allow_unsigned", &self.allow_unsigned)
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Clone)]
pub struct NotificationConfig {
    pub gateway_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl fmt::Debug for NotificationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationConfig")
            .field("gateway_url", &self.gateway_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl NotificationConfig {
    /// Settings for the HTTP gateway, if one is configured.
    pub fn http(&self) -> Option<HttpNotificationConfig> {
        self.gateway_url.as_ref().map(|url| HttpNotificationConfig {
            url: url.clone(),
            api_key: self.api_key.clone().unwrap_or_default(),
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
        })
    }
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn flag_var(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            environment: env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string())
                .parse()?,
        };

        let database = DatabaseConfig {
            url: env::var("DATABASE_URL").context("DATABASE_URL not set")?,
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("DATABASE_MAX_CONNECTIONS must be a valid number")?,
        };

        let redis = RedisConfig {
            url: optional_var("REDIS_URL"),
        };

        let webhook = WebhookConfig {
            secret: optional_var("WEBHOOK_SECRET"),
            signature_header: env::var("WEBHOOK_SIGNATURE_HEADER")
                .unwrap_or_else(|_| DEFAULT_SIGNATURE_HEADER.to_string())
                .to_ascii_lowercase(),
            allow_unsigned: flag_var("WEBHOOK_ALLOW_UNSIGNED"),
            source: env::var("WEBHOOK_SOURCE").unwrap_or_else(|_| "payment_provider".to_string()),
        };

        let notifications = NotificationConfig {
            gateway_url: optional_var("NOTIFICATION_GATEWAY_URL"),
            api_key: optional_var("NOTIFICATION_API_KEY"),
            timeout_secs: env::var("NOTIFICATION_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("NOTIFICATION_TIMEOUT_SECS must be a valid number")?,
            max_retries: env::var("NOTIFICATION_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("NOTIFICATION_MAX_RETRIES must be a valid number")?,
        };

        let config = Config {
            server,
            database,
            redis,
            webhook,
            verification: VerificationConfig::from_env(),
            reaper: ReaperConfig::from_env(),
            notifications,
        };

        config.validate()?;
        Ok(config)
    }

    /// Unsigned webhooks need both a non-production environment and the
    /// explicit opt-in.
    pub fn allows_unsigned_webhooks(&self) -> bool {
        !self.server.environment.is_production() && self.webhook.allow_unsigned
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port < 1024 {
            return Err(anyhow!(
                "Port must be at least 1024, got {}",
                self.server.port
            ));
        }

        if self.database.url.trim().is_empty() {
            return Err(anyhow!("DATABASE_URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(anyhow!("DATABASE_MAX_CONNECTIONS must be greater than 0"));
        }

        HeaderName::from_str(&self.webhook.signature_header).map_err(|_| {
            anyhow!(
                "WEBHOOK_SIGNATURE_HEADER is not a valid header name: {}",
                self.webhook.signature_header
            )
        })?;

        if self.server.environment.is_production() {
            if self.webhook.secret.is_none() {
                return Err(anyhow!("WEBHOOK_SECRET is required in production"));
            }
            if self.notifications.gateway_url.is_none() {
                return Err(anyhow!("NOTIFICATION_GATEWAY_URL is required in production"));
            }
        }

        if self.verification.batch_size <= 0 {
            return Err(anyhow!("VERIFICATION_BATCH_SIZE must be greater than 0"));
        }

        if self.reaper.batch_size <= 0 {
            return Err(anyhow!("REAPER_BATCH_SIZE must be greater than 0"));
        }

        if self.reaper.staleness <= chrono::Duration::zero() {
            return Err(anyhow!("REAPER_STALENESS_HOURS must be greater than 0"));
        }

        if self.reaper.interval.is_zero() {
            return Err(anyhow!("REAPER_INTERVAL_HOURS must be greater than 0"));
        }

        Ok(())
    }
}
