use crate::database::error::{DatabaseError, DbResult};
use crate::database::repository::OtpRepository;
use crate::payments::types::InsertOutcome;
use crate::payout::delivery::DeliveryOtp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

const OTP_COLUMNS: &str =
    "id, order_id, code, phone, delivery_address, created_at, dispatched_at, consumed_at, failed_attempts";

#[derive(Debug, Clone, FromRow)]
struct OtpRow {
    id: Uuid,
    order_id: String,
    code: String,
    phone: String,
    delivery_address: Option<String>,
    created_at: DateTime<Utc>,
    dispatched_at: Option<DateTime<Utc>>,
    consumed_at: Option<DateTime<Utc>>,
    failed_attempts: i32,
}

impl From<OtpRow> for DeliveryOtp {
    fn from(row: OtpRow) -> Self {
        DeliveryOtp {
            id: row.id,
            order_id: row.order_id,
            code: row.code,
            phone: row.phone,
            delivery_address: row.delivery_address,
            created_at: row.created_at,
            dispatched_at: row.dispatched_at,
            consumed_at: row.consumed_at,
            failed_attempts: row.failed_attempts,
        }
    }
}

/// Postgres store for delivery codes, unique per order
pub struct PgOtpRepository {
    pool: PgPool,
}

impl PgOtpRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OtpRepository for PgOtpRepository {
    async fn issue(&self, otp: &DeliveryOtp) -> DbResult<InsertOutcome<DeliveryOtp>> {
        let inserted = sqlx::query_as::<_, OtpRow>(&format!(
            "INSERT INTO delivery_otps ({OTP_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (order_id) DO NOTHING
             RETURNING {OTP_COLUMNS}"
        ))
        .bind(otp.id)
        .bind(&otp.order_id)
        .bind(&otp.code)
        .bind(&otp.phone)
        .bind(&otp.delivery_address)
        .bind(otp.created_at)
        .bind(otp.dispatched_at)
        .bind(otp.consumed_at)
        .bind(otp.failed_attempts)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Created(row.into()));
        }

        let existing = self
            .find_by_order(&otp.order_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("delivery otp", &otp.order_id))?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn find_by_order(&self, order_id: &str) -> DbResult<Option<DeliveryOtp>> {
        let row = sqlx::query_as::<_, OtpRow>(&format!(
            "SELECT {OTP_COLUMNS} FROM delivery_otps WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(DeliveryOtp::from))
    }

    async fn consume(&self, otp_id: Uuid, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE delivery_otps SET consumed_at = $2
             WHERE id = $1 AND consumed_at IS NULL",
        )
        .bind(otp_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_failed_attempt(&self, otp_id: Uuid) -> DbResult<i32> {
        sqlx::query_scalar::<_, i32>(
            "UPDATE delivery_otps SET failed_attempts = failed_attempts + 1
             WHERE id = $1
             RETURNING failed_attempts",
        )
        .bind(otp_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .ok_or_else(|| DatabaseError::not_found("delivery otp", otp_id.to_string()))
    }

    async fn mark_dispatched(&self, otp_id: Uuid, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE delivery_otps SET dispatched_at = $2 WHERE id = $1")
            .bind(otp_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn pending_dispatch(&self, limit: i64) -> DbResult<Vec<DeliveryOtp>> {
        let rows = sqlx::query_as::<_, OtpRow>(&format!(
            "SELECT {OTP_COLUMNS} FROM delivery_otps
             WHERE dispatched_at IS NULL AND consumed_at IS NULL
             ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(rows.into_iter().map(DeliveryOtp::from).collect())
    }
}
