use crate::database::error::{DatabaseError, DbResult};
use crate::payments::traits::{ClaimedTask, TaskQueue, MAX_TASK_ATTEMPTS};
use crate::payments::types::VerificationTask;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};

const TASK_COLUMNS: &str =
    "transaction_reference, amount, order_id, customer_phone, payment_date, raw_payload";

#[derive(Debug, Clone, FromRow)]
struct TaskRow {
    transaction_reference: String,
    amount: Decimal,
    order_id: String,
    customer_phone: String,
    payment_date: DateTime<Utc>,
    raw_payload: serde_json::Value,
}

#[derive(Debug, Clone, FromRow)]
struct ClaimedRow {
    #[sqlx(flatten)]
    task: TaskRow,
    attempts: i32,
}

impl From<TaskRow> for VerificationTask {
    fn from(row: TaskRow) -> Self {
        VerificationTask {
            amount: row.amount,
            transaction_reference: row.transaction_reference,
            order_id: row.order_id,
            customer_phone: row.customer_phone,
            payment_date: row.payment_date,
            raw_payload: row.raw_payload,
        }
    }
}

/// Verification queue on a `verification_tasks` table
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers can poll the
/// same table without handing one task to two of them inside a lease.
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: &VerificationTask) -> DbResult<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO verification_tasks ({TASK_COLUMNS}, attempts, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, 0, NOW())
             ON CONFLICT (transaction_reference) DO NOTHING"
        ))
        .bind(&task.transaction_reference)
        .bind(task.amount)
        .bind(&task.order_id)
        .bind(&task.customer_phone)
        .bind(task.payment_date)
        .bind(&task.raw_payload)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> DbResult<Vec<ClaimedTask>> {
        let rows = sqlx::query_as::<_, ClaimedRow>(&format!(
            "UPDATE verification_tasks
             SET attempts = attempts + 1, claimed_at = $1
             WHERE transaction_reference IN (
                 SELECT transaction_reference FROM verification_tasks
                 WHERE completed_at IS NULL
                   AND attempts < $2
                   AND available_at <= $1
                   AND (claimed_at IS NULL OR claimed_at <= $3)
                 ORDER BY created_at ASC
                 LIMIT $4
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {TASK_COLUMNS}, attempts"
        ))
        .bind(now)
        .bind(MAX_TASK_ATTEMPTS)
        .bind(now - lease)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(rows
            .into_iter()
            .map(|row| ClaimedTask {
                attempt: row.attempts,
                task: row.task.into(),
            })
            .collect())
    }

    async fn complete(&self, transaction_reference: &str, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            "UPDATE verification_tasks SET completed_at = $2, last_error = NULL
             WHERE transaction_reference = $1",
        )
        .bind(transaction_reference)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn fail(
        &self,
        transaction_reference: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE verification_tasks
             SET last_error = $2, claimed_at = NULL, available_at = $3
             WHERE transaction_reference = $1",
        )
        .bind(transaction_reference)
        .bind(error)
        .bind(retry_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
