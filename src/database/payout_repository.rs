use crate::database::error::{DatabaseError, DbResult};
use crate::database::repository::PayoutRepository;
use crate::payments::types::InsertOutcome;
use crate::payout::state::{Payout, PayoutStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

const PAYOUT_COLUMNS: &str = "id, order_id, status, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct PayoutRow {
    id: Uuid,
    order_id: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PayoutRow> for Payout {
    type Error = DatabaseError;

    fn try_from(row: PayoutRow) -> Result<Self, Self::Error> {
        let status = PayoutStatus::parse(&row.status).ok_or_else(|| {
            DatabaseError::invalid_data("payout", format!("unknown status '{}'", row.status))
        })?;
        Ok(Payout {
            id: row.id,
            order_id: row.order_id,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres store for payouts
///
/// Status changes are a single conditional UPDATE on the expected prior
/// status; no row locks are held across calls.
pub struct PgPayoutRepository {
    pool: PgPool,
}

impl PgPayoutRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PayoutRepository for PgPayoutRepository {
    async fn mark_intent(&self, order_id: &str, now: DateTime<Utc>) -> DbResult<InsertOutcome<Payout>> {
        let payout = Payout::intent(order_id, now);
        let inserted = sqlx::query_as::<_, PayoutRow>(&format!(
            "INSERT INTO payouts ({PAYOUT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (order_id) DO NOTHING
             RETURNING {PAYOUT_COLUMNS}"
        ))
        .bind(payout.id)
        .bind(&payout.order_id)
        .bind(payout.status.as_str())
        .bind(payout.created_at)
        .bind(payout.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Created(row.try_into()?));
        }

        let existing = self
            .find_by_order(order_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("payout", order_id))?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn find_by_order(&self, order_id: &str) -> DbResult<Option<Payout>> {
        sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Payout::try_from)
        .transpose()
    }

    async fn compare_and_set(
        &self,
        payout_id: Uuid,
        expected: PayoutStatus,
        next: PayoutStatus,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE payouts SET status = $3, updated_at = $4
             WHERE id = $1 AND status = $2",
        )
        .bind(payout_id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_stale(
        &self,
        statuses: &[PayoutStatus],
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<Payout>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();

        sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts
             WHERE status = ANY($1) AND created_at < $2
             ORDER BY created_at ASC LIMIT $3"
        ))
        .bind(statuses)
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .into_iter()
        .map(Payout::try_from)
        .collect()
    }
}
