use crate::database::error::{DatabaseError, DbResult};
use crate::database::repository::PaymentRepository;
use crate::database::transaction::DatabaseTransaction;
use crate::payments::types::{
    InsertOutcome, MismatchStatus, Payment, PaymentMismatch, PaymentStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

const PAYMENT_COLUMNS: &str = "id, transaction_reference, order_id, amount, customer_phone, payment_date, status, raw_payload, verified_at, created_at";

const MISMATCH_COLUMNS: &str = "id, transaction_reference, order_id, expected_amount, received_amount, delta, status, resolved_at, resolution_note, created_at";

/// Payment row as stored
#[derive(Debug, Clone, FromRow)]
struct PaymentRow {
    id: Uuid,
    transaction_reference: String,
    order_id: String,
    amount: Decimal,
    customer_phone: String,
    payment_date: DateTime<Utc>,
    status: String,
    raw_payload: serde_json::Value,
    verified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = DatabaseError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let status = PaymentStatus::parse(&row.status).ok_or_else(|| {
            DatabaseError::invalid_data("payment", format!("unknown status '{}'", row.status))
        })?;
        Ok(Payment {
            id: row.id,
            transaction_reference: row.transaction_reference,
            order_id: row.order_id,
            amount: row.amount,
            customer_phone: row.customer_phone,
            payment_date: row.payment_date,
            status,
            raw_payload: row.raw_payload,
            verified_at: row.verified_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct MismatchRow {
    id: Uuid,
    transaction_reference: String,
    order_id: String,
    expected_amount: Decimal,
    received_amount: Decimal,
    delta: Decimal,
    status: String,
    resolved_at: Option<DateTime<Utc>>,
    resolution_note: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MismatchRow> for PaymentMismatch {
    type Error = DatabaseError;

    fn try_from(row: MismatchRow) -> Result<Self, Self::Error> {
        let status = MismatchStatus::parse(&row.status).ok_or_else(|| {
            DatabaseError::invalid_data("payment mismatch", format!("unknown status '{}'", row.status))
        })?;
        Ok(PaymentMismatch {
            id: row.id,
            transaction_reference: row.transaction_reference,
            order_id: row.order_id,
            expected_amount: row.expected_amount,
            received_amount: row.received_amount,
            delta: row.delta,
            status,
            resolved_at: row.resolved_at,
            resolution_note: row.resolution_note,
            created_at: row.created_at,
        })
    }
}

/// Postgres store for payments and their mismatches
pub struct PgPaymentRepository {
    pool: PgPool,
}

impl PgPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentRepository for PgPaymentRepository {
    async fn insert_if_absent(&self, payment: &Payment) -> DbResult<InsertOutcome<Payment>> {
        let inserted = sqlx::query_as::<_, PaymentRow>(&format!(
            "INSERT INTO payments ({PAYMENT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (transaction_reference) DO NOTHING
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(payment.id)
        .bind(&payment.transaction_reference)
        .bind(&payment.order_id)
        .bind(payment.amount)
        .bind(&payment.customer_phone)
        .bind(payment.payment_date)
        .bind(payment.status.as_str())
        .bind(&payment.raw_payload)
        .bind(payment.verified_at)
        .bind(payment.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Created(row.try_into()?));
        }

        let existing = self
            .find_by_reference(&payment.transaction_reference)
            .await?
            .ok_or_else(|| DatabaseError::not_found("payment", &payment.transaction_reference))?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn find_by_reference(&self, reference: &str) -> DbResult<Option<Payment>> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE transaction_reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Payment::try_from)
        .transpose()
    }

    async fn mark_confirmed(&self, reference: &str, verified_at: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE payments SET status = $2, verified_at = $3
             WHERE transaction_reference = $1 AND status = $4",
        )
        .bind(reference)
        .bind(PaymentStatus::Confirmed.as_str())
        .bind(verified_at)
        .bind(PaymentStatus::Pending.as_str())
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_mismatch(
        &self,
        mismatch: &PaymentMismatch,
        verified_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut tx = DatabaseTransaction::begin(&self.pool).await?;

        let result = sqlx::query(
            "UPDATE payments SET status = $2, verified_at = $3
             WHERE transaction_reference = $1 AND status = $4",
        )
        .bind(&mismatch.transaction_reference)
        .bind(PaymentStatus::VerificationFailed.as_str())
        .bind(verified_at)
        .bind(PaymentStatus::Pending.as_str())
        .execute(tx.conn()?)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(&format!(
            "INSERT INTO payment_mismatches ({MISMATCH_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(mismatch.id)
        .bind(&mismatch.transaction_reference)
        .bind(&mismatch.order_id)
        .bind(mismatch.expected_amount)
        .bind(mismatch.received_amount)
        .bind(mismatch.delta)
        .bind(mismatch.status.as_str())
        .bind(mismatch.resolved_at)
        .bind(&mismatch.resolution_note)
        .bind(mismatch.created_at)
        .execute(tx.conn()?)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mismatches_for_order(&self, order_id: &str) -> DbResult<Vec<PaymentMismatch>> {
        sqlx::query_as::<_, MismatchRow>(&format!(
            "SELECT {MISMATCH_COLUMNS} FROM payment_mismatches
             WHERE order_id = $1 ORDER BY created_at ASC"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .into_iter()
        .map(PaymentMismatch::try_from)
        .collect()
    }
}
