//! Redis-backed job lease
//!
//! `SET key token NX PX ttl` to take the lease, and a compare-and-delete
//! script to give it back so an expired holder never frees a successor's lease.

use super::RedisPool;
use crate::lock::{JobLock, LockError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const KEY_PREFIX: &str = "payguard:lock:";

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisJobLock {
    pool: RedisPool,
}

impl RedisJobLock {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn key(name: &str) -> String {
        format!("{}{}", KEY_PREFIX, name)
    }
}

#[async_trait]
impl JobLock for RedisJobLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<String>, LockError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            warn!("Failed to get Redis connection for lock: {}", e);
            LockError::Backend(e.to_string())
        })?;

        let token = Uuid::new_v4().to_string();
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key(name))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if reply.is_some() {
            debug!(lock = name, "lease acquired");
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, name: &str, token: &str) -> Result<(), LockError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            warn!("Failed to get Redis connection for lock release: {}", e);
            LockError::Backend(e.to_string())
        })?;

        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::key(name))
            .arg(token)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_keys_are_namespaced() {
        assert_eq!(RedisJobLock::key("stale_payout_reaper"), "payguard:lock:stale_payout_reaper");
    }
}
