use crate::database::error::{DatabaseError, DbResult};
use crate::database::repository::WebhookLogRepository;
use crate::payments::types::RawWebhookAttempt;
use async_trait::async_trait;
use sqlx::PgPool;

/// Append-only log of every inbound webhook, written before validation
pub struct PgWebhookLog {
    pool: PgPool,
}

impl PgWebhookLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookLogRepository for PgWebhookLog {
    async fn log_attempt(&self, attempt: &RawWebhookAttempt) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO webhook_attempts (id, source, source_address, headers, payload, received_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(attempt.id)
        .bind(&attempt.source)
        .bind(&attempt.source_address)
        .bind(&attempt.headers)
        .bind(&attempt.payload)
        .bind(attempt.received_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
