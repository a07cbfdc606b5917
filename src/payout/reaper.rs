//! Stale payout reaper
//!
//! Payouts that sit in `intent_marked` or `receipt_confirmed` past the
//! staleness window are moved to `auto_reverted`. Runs on a fixed interval and
//! once a day at a fixed UTC time; overlapping triggers collapse into a single
//! run through an in-process try-lock and a named lease shared across
//! instances.

use crate::audit::{ActionKind, AuditLogger};
use crate::clock::Clock;
use crate::database::error::DatabaseError;
use crate::database::repository::PayoutRepository;
use crate::events::{DomainEvent, EventBus};
use crate::lock::JobLock;
use crate::payout::machine::{PayoutStateMachine, TransitionOutcome};
use crate::payout::state::{PayoutStatus, TransitionAuthority, STALE_CANDIDATES};
use chrono::{DateTime, NaiveTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

pub const REAPER_LOCK_NAME: &str = "stale_payout_reaper";

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// UTC wall-clock time of the daily sweep.
    pub daily_at: NaiveTime,
    pub staleness: chrono::Duration,
    pub batch_size: i64,
    pub lease_ttl: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2 * 60 * 60),
            daily_at: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or(NaiveTime::MIN),
            staleness: chrono::Duration::hours(48),
            batch_size: 100,
            lease_ttl: Duration::from_secs(10 * 60),
        }
    }
}

impl ReaperConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        cfg.interval = Duration::from_secs(
            std::env::var("REAPER_INTERVAL_HOURS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|h| h * 60 * 60)
                .unwrap_or(cfg.interval.as_secs()),
        );

        cfg.daily_at = std::env::var("REAPER_DAILY_AT")
            .ok()
            .and_then(|v| NaiveTime::parse_from_str(&v, "%H:%M").ok())
            .unwrap_or(cfg.daily_at);

        cfg.staleness = std::env::var("REAPER_STALENESS_HOURS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .map(chrono::Duration::hours)
            .unwrap_or(cfg.staleness);

        cfg.batch_size = std::env::var("REAPER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(cfg.batch_size);

        cfg.lease_ttl = Duration::from_secs(
            std::env::var("REAPER_LEASE_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.lease_ttl.as_secs()),
        );

        cfg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapRun {
    Completed { reverted: usize },
    /// Another run held the in-process lock or the shared lease.
    Skipped,
}

pub struct StalePayoutReaper {
    machine: PayoutStateMachine,
    payouts: Arc<dyn PayoutRepository>,
    audit: AuditLogger,
    events: EventBus,
    lock: Arc<dyn JobLock>,
    clock: Arc<dyn Clock>,
    config: ReaperConfig,
    running: Mutex<()>,
}

impl StalePayoutReaper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machine: PayoutStateMachine,
        payouts: Arc<dyn PayoutRepository>,
        audit: AuditLogger,
        events: EventBus,
        lock: Arc<dyn JobLock>,
        clock: Arc<dyn Clock>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            machine,
            payouts,
            audit,
            events,
            lock,
            clock,
            config,
            running: Mutex::new(()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            daily_at = %self.config.daily_at,
            "Starting stale payout reaper"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let now = self.clock.now();
            let until_daily = (next_daily_run(now, self.config.daily_at) - now)
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = interval.tick() => self.trigger("interval").await,
                _ = tokio::time::sleep(until_daily) => self.trigger("daily").await,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Stale payout reaper received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!("Stale payout reaper stopped");
    }

    async fn trigger(&self, trigger: &'static str) {
        match self.run_once().await {
            Ok(ReapRun::Skipped) => debug!(trigger, "reaper run skipped, already running"),
            Ok(ReapRun::Completed { .. }) => {}
            Err(e) => error!(
                trigger,
                error = %e,
                retryable = e.is_retryable(),
                "stale payout reaper run failed"
            ),
        }
    }

    /// One sweep. Safe to call concurrently from any number of instances.
    #[instrument(skip(self), name = "stale_payout_reaper_run")]
    pub async fn run_once(&self) -> Result<ReapRun, DatabaseError> {
        let _guard = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(ReapRun::Skipped),
        };

        let token = match self
            .lock
            .try_acquire(REAPER_LOCK_NAME, self.config.lease_ttl)
            .await
        {
            Ok(Some(token)) => token,
            Ok(None) => return Ok(ReapRun::Skipped),
            Err(e) => {
                warn!(error = %e, "could not take reaper lease, skipping run");
                return Ok(ReapRun::Skipped);
            }
        };

        let result = self.sweep().await;

        if let Err(e) = self.lock.release(REAPER_LOCK_NAME, &token).await {
            warn!(error = %e, "failed to release reaper lease, it will expire");
        }

        let reverted = result?;
        info!(reverted, "stale payout reaper run complete");
        Ok(ReapRun::Completed { reverted })
    }

    async fn sweep(&self) -> Result<usize, DatabaseError> {
        let now = self.clock.now();
        let cutoff = now - self.config.staleness;
        let mut reverted = 0;

        loop {
            let batch = self
                .payouts
                .find_stale(&STALE_CANDIDATES, cutoff, self.config.batch_size)
                .await?;
            let fetched = batch.len();
            let mut reverted_in_batch = 0;

            for payout in batch {
                let outcome = self
                    .machine
                    .transition(&payout, PayoutStatus::AutoReverted, TransitionAuthority::Reaper)
                    .await;

                match outcome {
                    Ok(TransitionOutcome::Applied(_)) => {
                        reverted_in_batch += 1;
                        let elapsed_hours = (now - payout.created_at).num_hours();
                        self.audit
                            .system(
                                ActionKind::PayoutAutoReverted,
                                json!({
                                    "payout_id": payout.id,
                                    "order_id": payout.order_id,
                                    "prior_status": payout.status.as_str(),
                                    "elapsed_hours": elapsed_hours,
                                }),
                            )
                            .await;
                        self.events.publish(DomainEvent::PayoutAutoReverted {
                            order_id: payout.order_id.clone(),
                            prior_status: payout.status.as_str().to_string(),
                        });
                    }
                    Ok(TransitionOutcome::Lost { current }) => {
                        debug!(order_id = %payout.order_id, current = %current, "payout moved before reaper");
                    }
                    Err(e) => {
                        warn!(order_id = %payout.order_id, error = %e, "failed to revert stale payout");
                    }
                }
            }

            reverted += reverted_in_batch;
            if (fetched as i64) < self.config.batch_size || reverted_in_batch == 0 {
                break;
            }
        }

        Ok(reverted)
    }
}

/// First occurrence of `at` (UTC) strictly after `now`.
pub fn next_daily_run(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::database::memory::{InMemoryAuditSink, InMemoryPayouts};
    use crate::lock::InMemoryJobLock;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_next_daily_run_later_today() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 1, 30, 0).unwrap();
        assert_eq!(
            next_daily_run(now, at(3, 0)),
            Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_daily_run_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap();
        assert_eq!(
            next_daily_run(now, at(3, 0)),
            Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_default_schedule() {
        let cfg = ReaperConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(7200));
        assert_eq!(cfg.daily_at, at(3, 0));
        assert_eq!(cfg.staleness, chrono::Duration::hours(48));
    }

    #[tokio::test]
    async fn test_batches_until_exhausted() {
        let clock = Arc::new(ManualClock::default());
        let payouts = Arc::new(InMemoryPayouts::new());
        let sink = Arc::new(InMemoryAuditSink::new());
        let audit = AuditLogger::new(sink.clone(), clock.clone());
        let machine = PayoutStateMachine::new(payouts.clone(), audit.clone(), clock.clone());

        for i in 0..5 {
            payouts
                .mark_intent(&format!("ORD-{i}"), clock.now())
                .await
                .unwrap();
        }
        clock.advance(chrono::Duration::hours(49));

        let reaper = StalePayoutReaper::new(
            machine,
            payouts.clone(),
            audit,
            EventBus::default(),
            Arc::new(InMemoryJobLock::new()),
            clock,
            ReaperConfig {
                batch_size: 2,
                ..ReaperConfig::default()
            },
        );

        assert_eq!(reaper.run_once().await.unwrap(), ReapRun::Completed { reverted: 5 });
        assert_eq!(sink.count(ActionKind::PayoutAutoReverted).await, 5);
        assert_eq!(reaper.run_once().await.unwrap(), ReapRun::Completed { reverted: 0 });
    }
}
