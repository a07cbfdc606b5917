//! Named leases for jobs that must run on one instance at a time.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Backend(String),
}

/// A lease that expires on its own if the holder dies.
#[async_trait]
pub trait JobLock: Send + Sync {
    /// Returns a holder token if the lease was free.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<String>, LockError>;

    /// Release only if `token` still holds the lease.
    async fn release(&self, name: &str, token: &str) -> Result<(), LockError>;
}

/// Process-local leases for development and tests.
#[derive(Default)]
pub struct InMemoryJobLock {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryJobLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLock for InMemoryJobLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<String>, LockError> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = leases.get(name) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        leases.insert(name.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, name: &str, token: &str) -> Result<(), LockError> {
        let mut leases = self.leases.lock().await;
        if leases.get(name).map(|(held, _)| held == token).unwrap_or(false) {
            leases.remove(name);
        }
        Ok(())
    }
}
