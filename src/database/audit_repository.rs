use crate::audit::{AuditEntry, AuditSink};
use crate::database::error::{DatabaseError, DbResult};
use async_trait::async_trait;
use sqlx::PgPool;

/// Append-only `audit_log` table. There is no update or delete path.
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, entry: &AuditEntry) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO audit_log (id, action, severity, actor_id, source_address, message, context, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.id)
        .bind(entry.action.as_str())
        .bind(entry.severity.as_str())
        .bind(&entry.actor_id)
        .bind(&entry.source_address)
        .bind(&entry.message)
        .bind(&entry.context)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
