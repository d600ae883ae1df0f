//! Redis cache pool management using deadpool-redis

use crate::errors::StorageError;
use anyhow::Result;
use deadpool_redis::{Config, Pool, Runtime};

/// Create a Redis connection pool from a Redis URL
///
/// # Arguments
/// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
///
/// # Returns
/// A deadpool-redis Pool configured for async operation
pub fn create_cache_pool(redis_url: &str) -> Result<Pool> {
    let cfg = Config::from_url(redis_url);
    cfg.create_pool(Some(Runtime::Tokio1)).map_err(|err| {
        StorageError::ConnectionFailed {
            source: sqlx::Error::Configuration(
                format!("Failed to create Redis pool: {}", err).into(),
            ),
        }
        .into()
    })
}

/// Redis keys for the coordination cache
pub mod keys {
    /// Prefix for the per-user auto-post lock
    pub const AUTOPOST_LOCK_PREFIX: &str = "autopost:lock";

    /// Prefix for the discovery seen-set
    pub const SEEN_POST_PREFIX: &str = "discovery:seen";

    /// Prefix for pending OAuth authorizations
    pub const OAUTH_PENDING_PREFIX: &str = "oauth:pending";

    /// Prefix for job-trigger idempotency slots
    pub const JOB_SLOT_PREFIX: &str = "jobs:slot";

    /// Build the auto-post lock key for a user
    pub fn autopost_lock_key(user_id: &str) -> String {
        format!("{}:{}", AUTOPOST_LOCK_PREFIX, user_id)
    }

    /// Build a seen-set key for a discovered post
    pub fn seen_post_key(user_id: &str, post_id: &str) -> String {
        format!("{}:{}:{}", SEEN_POST_PREFIX, user_id, post_id)
    }

    /// Build the pending-OAuth key for a state parameter
    pub fn oauth_pending_key(state: &str) -> String {
        format!("{}:{}", OAUTH_PENDING_PREFIX, state)
    }

    /// Build a job idempotency slot key
    pub fn job_slot_key(kind: &str, user_id: &str, bucket: i64) -> String {
        format!("{}:{}:{}:{}", JOB_SLOT_PREFIX, kind, user_id, bucket)
    }
}
