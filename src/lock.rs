//! Distributed Lock: per-symbol mutual exclusion across replicas. The
//! production version of this is backed by something like Redis; this
//! crate ships an in-memory, TTL-leased reference implementation that
//! honors the same contract (bounded acquire timeout, TTL so a crashed
//! holder never blocks forever).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::errors::EngineError;

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire an advisory lease on `key`, waiting up to `timeout`. Returns a
    /// lease token that must be passed to `release`.
    async fn acquire(&self, key: &str, ttl: Duration, timeout: Duration) -> Result<Uuid, EngineError>;

    async fn release(&self, key: &str, token: Uuid);
}

struct Lease {
    token: Uuid,
    expires_at: Instant,
}

/// Single-process advisory lock keyed by symbol. Not suitable across
/// replicas by itself — stand-in for a Redis/etcd-backed lease in
/// multi-process deployments, which is an external collaborator.
#[derive(Default)]
pub struct InMemoryLock {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, key: &str, ttl: Duration) -> Option<Uuid> {
        let mut leases = self.leases.lock().unwrap();
        let now = Instant::now();
        let expired = leases.get(key).map(|l| l.expires_at <= now).unwrap_or(true);
        if expired {
            let token = Uuid::new_v4();
            leases.insert(
                key.to_string(),
                Lease {
                    token,
                    expires_at: now + ttl,
                },
            );
            Some(token)
        } else {
            None
        }
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, key: &str, ttl: Duration, timeout: Duration) -> Result<Uuid, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(token) = self.try_acquire(key, ttl) {
                return Ok(token);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::LockTimeout {
                    symbol: key.to_string(),
                    attempted: timeout,
                });
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn release(&self, key: &str, token: Uuid) {
        let mut leases = self.leases.lock().unwrap();
        if let Some(lease) = leases.get(key) {
            if lease.token == token {
                leases.remove(key);
            }
        }
    }
}

/// RAII helper so callers never forget to release under an early return.
pub struct LockGuard<'a> {
    lock: &'a dyn DistributedLock,
    key: String,
    token: Uuid,
    released: bool,
}

impl<'a> LockGuard<'a> {
    pub async fn acquire(
        lock: &'a dyn DistributedLock,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<LockGuard<'a>, EngineError> {
        let token = lock.acquire(key, ttl, timeout).await?;
        Ok(Self {
            lock,
            key: key.to_string(),
            token,
            released: false,
        })
    }

    pub async fn release(mut self) {
        self.lock.release(&self.key, self.token).await;
        self.released = true;
    }
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        if !self.released {
            // Best-effort synchronous release path is unavailable for an
            // async lock; callers are expected to call `release()`
            // explicitly. This guards against leaking the struct silently.
            tracing::warn!(key = %self.key, "lock guard dropped without explicit release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let lock = InMemoryLock::new();
        let token = lock
            .acquire("BTCUSDT", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
        let err = lock
            .acquire("BTCUSDT", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout { .. }));
        lock.release("BTCUSDT", token).await;
        lock.acquire("BTCUSDT", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_ttl_allows_reacquire() {
        let lock = InMemoryLock::new();
        lock.acquire("ETHUSDT", Duration::from_millis(10), Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        lock.acquire("ETHUSDT", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cross_symbol_locks_are_independent() {
        let lock = InMemoryLock::new();
        let _a = lock
            .acquire("BTCUSDT", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
        lock.acquire("ETHUSDT", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
    }
}
