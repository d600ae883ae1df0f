//! Cross-instance coordination primitives.
//!
//! Auto-post mutual exclusion, the discovery seen-set, pending OAuth state,
//! and job-trigger dedup all reduce to a handful of key/value operations with
//! TTLs. The trait has two implementations: Redis for distributed
//! deployments, and an in-memory degraded mode used for single-instance runs
//! and deterministic tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use deadpool_redis::{Pool as RedisPool, redis::AsyncCommands};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait CoordinationCache: Send + Sync {
    /// Atomically acquire `key` for `holder` with a TTL. Returns false when
    /// another holder currently owns the key.
    async fn acquire_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release `key`, but only if `holder` still owns it.
    async fn release_lock(&self, key: &str, holder: &str) -> Result<()>;

    /// Record membership of `key` in a TTL-bounded seen set.
    async fn mark_seen(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn was_seen(&self, key: &str) -> Result<bool>;

    /// Store an ephemeral value (pending OAuth state) with a TTL.
    async fn put_pending(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Consume an ephemeral value exactly once.
    async fn take_pending(&self, key: &str) -> Result<Option<String>>;

    /// Set-if-not-exists slot claim used for job-trigger idempotency.
    async fn claim_slot(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Redis-backed coordination using `SET key value EX ttl NX` and an atomic
/// check-and-delete script for lock release.
pub struct RedisCoordination {
    pool: RedisPool,
}

impl RedisCoordination {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))?;

        let previous: Option<String> = conn
            .set_options(
                key,
                value,
                deadpool_redis::redis::SetOptions::default()
                    .conditional_set(deadpool_redis::redis::ExistenceCheck::NX)
                    .get(true)
                    .with_expiration(deadpool_redis::redis::SetExpiry::EX(ttl.as_secs())),
            )
            .await?;

        // NX with GET returns the previous value when the key already existed.
        Ok(previous.is_none())
    }
}

#[async_trait]
impl CoordinationCache for RedisCoordination {
    async fn acquire_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let acquired = self.set_nx_ex(key, holder, ttl).await?;
        debug!(key = %key, acquired, "Lock acquisition attempted");
        Ok(acquired)
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))?;

        // Check-and-delete must be atomic so a holder whose TTL lapsed cannot
        // release a lock re-acquired by someone else.
        let lua_script = r#"
            local current = redis.call('GET', KEYS[1])
            if current == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            else
                return 0
            end
        "#;

        let released: i32 = deadpool_redis::redis::Script::new(lua_script)
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;

        if released == 0 {
            debug!(key = %key, "Lock not held by this holder - nothing to release");
        }

        Ok(())
    }

    async fn mark_seen(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))?;
        let _: () = conn.set_ex(key, "1", ttl.as_secs()).await?;
        Ok(())
    }

    async fn was_seen(&self, key: &str) -> Result<bool> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn put_pending(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))?;
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn take_pending(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))?;
        let value: Option<String> = conn.get(key).await?;
        if value.is_some() {
            let _: () = conn.del(key).await?;
        }
        Ok(value)
    }

    async fn claim_slot(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.set_nx_ex(key, "1", ttl).await
    }
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// In-memory coordination for single-instance deployments and tests. Provides
/// the same semantics within one process; expiry is evaluated lazily.
#[derive(Default)]
pub struct MemoryCoordination {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationCache for MemoryCoordination {
    async fn acquire_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(Entry::live) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: holder.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|e| e.live() && e.value == holder) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn mark_seen(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: "1".to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn was_seen(&self, key: &str) -> Result<bool> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).is_some_and(Entry::live))
    }

    async fn put_pending(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn take_pending(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        Ok(entries
            .remove(key)
            .filter(Entry::live)
            .map(|entry| entry.value))
    }

    async fn claim_slot(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.acquire_lock(key, "1", ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let cache = MemoryCoordination::new();
        let ttl = Duration::from_secs(60);

        assert!(cache.acquire_lock("lock:u1", "a", ttl).await.unwrap());
        assert!(!cache.acquire_lock("lock:u1", "b", ttl).await.unwrap());

        // A non-holder release is a no-op.
        cache.release_lock("lock:u1", "b").await.unwrap();
        assert!(!cache.acquire_lock("lock:u1", "b", ttl).await.unwrap());

        cache.release_lock("lock:u1", "a").await.unwrap();
        assert!(cache.acquire_lock("lock:u1", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let cache = MemoryCoordination::new();
        assert!(
            cache
                .acquire_lock("lock:u1", "a", Duration::from_millis(10))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            cache
                .acquire_lock("lock:u1", "b", Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn seen_set_membership_expires() {
        let cache = MemoryCoordination::new();
        cache
            .mark_seen("seen:u1:123", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(cache.was_seen("seen:u1:123").await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!cache.was_seen("seen:u1:123").await.unwrap());
    }

    #[tokio::test]
    async fn pending_value_is_consumed_once() {
        let cache = MemoryCoordination::new();
        cache
            .put_pending("oauth:pending:state1", "verifier", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            cache.take_pending("oauth:pending:state1").await.unwrap(),
            Some("verifier".to_string())
        );
        assert_eq!(cache.take_pending("oauth:pending:state1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn slot_claims_collapse_within_ttl() {
        let cache = MemoryCoordination::new();
        let ttl = Duration::from_secs(60);
        assert!(cache.claim_slot("jobs:slot:discover:u1:100", ttl).await.unwrap());
        assert!(!cache.claim_slot("jobs:slot:discover:u1:100", ttl).await.unwrap());
        assert!(cache.claim_slot("jobs:slot:discover:u1:101", ttl).await.unwrap());
    }
}
