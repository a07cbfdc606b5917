//! Collaborator interfaces consumed by the payment pipeline
//!
//! The commerce subsystem owns orders and the queue substrate owns task
//! delivery; this crate only talks to them through these traits.

use crate::database::error::DbResult;
use crate::payments::types::{Order, VerificationTask};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// A task claimed this many times is abandoned and reported.
pub const MAX_TASK_ATTEMPTS: i32 = 5;

const RETRY_BASE_SECONDS: i64 = 30;
const RETRY_CAP_SECONDS: i64 = 30 * 60;

/// Delay before a task that failed on its `attempt`-th claim is runnable
/// again. Doubles per attempt from 30 s, capped at 30 min.
pub fn retry_delay(attempt: i32) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 16) as u32;
    let seconds = RETRY_BASE_SECONDS.saturating_mul(1 << exponent);
    Duration::seconds(seconds.min(RETRY_CAP_SECONDS))
}

/// A task handed to a worker, with the attempt number this claim counted as.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: VerificationTask,
    pub attempt: i32,
}

impl ClaimedTask {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= MAX_TASK_ATTEMPTS
    }
}

/// Read-only access to commerce orders
#[async_trait]
pub trait OrderLookup: Send + Sync {
    /// Find an order by its public order number.
    ///
    /// # Returns
    /// * `None` - No order with that number exists
    async fn find_order(&self, order_number: &str) -> DbResult<Option<Order>>;
}

/// At-least-once queue of verification tasks
///
/// Enqueueing is idempotent per transaction reference. A claimed task that is
/// neither completed nor failed within the lease is handed out again, which is
/// why the worker must tolerate seeing the same task twice.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// # Returns
    /// * `false` - A task for this transaction reference already exists
    async fn enqueue(&self, task: &VerificationTask) -> DbResult<bool>;

    /// Claim up to `limit` runnable tasks, oldest first. Claiming counts as an
    /// attempt.
    async fn claim(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> DbResult<Vec<ClaimedTask>>;

    async fn complete(&self, transaction_reference: &str, now: DateTime<Utc>) -> DbResult<()>;

    /// Record the failure of the current attempt and release the claim. The
    /// task becomes claimable again at `retry_at` until it runs out of
    /// attempts.
    async fn fail(
        &self,
        transaction_reference: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> DbResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay(1), Duration::seconds(30));
        assert_eq!(retry_delay(2), Duration::seconds(60));
        assert_eq!(retry_delay(4), Duration::seconds(240));
        assert_eq!(retry_delay(12), Duration::minutes(30));
        assert_eq!(retry_delay(0), Duration::seconds(30));
    }
}
