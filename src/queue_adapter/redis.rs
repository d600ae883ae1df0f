//! Redis-backed queue adapter with at-least-once delivery.
//!
//! Jobs are LPUSHed onto a primary list and RPOPLPUSHed into a per-worker
//! in-progress list on pull. Acknowledging a job removes it from the worker
//! list; a worker that restarts recovers its in-progress jobs back onto the
//! primary list before pulling new ones.

use anyhow::Result;
use async_trait::async_trait;
use deadpool_redis::{Pool, redis::AsyncCommands};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tracing::{debug, error, trace};

use super::QueueAdapter;
use crate::errors::QueueError;

pub struct RedisQueueAdapter<T>
where
    T: Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static,
{
    pool: Pool,
    worker_id: String,
    primary_queue_name: String,
    worker_queue_name: String,
    _phantom: PhantomData<T>,
}

impl<T> RedisQueueAdapter<T>
where
    T: Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static,
{
    /// Create an adapter for one job kind. Queue keys are
    /// `jobs:queue:<kind>:primary` and `jobs:queue:<kind>:<worker_id>`.
    pub fn new(pool: Pool, kind: &str, worker_id: Option<String>) -> Self {
        let worker_id = worker_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let primary_queue_name = format!("jobs:queue:{}:primary", kind);
        let worker_queue_name = format!("jobs:queue:{}:{}", kind, worker_id);

        debug!(
            worker_id = %worker_id,
            primary_queue = %primary_queue_name,
            "Initializing Redis queue adapter"
        );

        Self {
            pool,
            worker_id,
            primary_queue_name,
            worker_queue_name,
            _phantom: PhantomData,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Move any jobs left in this worker's in-progress list back onto the
    /// primary list. Call on startup; returns the number of recovered jobs.
    pub async fn recover_worker_queue(&self) -> Result<usize> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                queue_type: "redis".to_string(),
                details: e.to_string(),
            })?;

        let mut recovered = 0;
        loop {
            let item: Option<String> = conn
                .rpoplpush(&self.worker_queue_name, &self.primary_queue_name)
                .await
                .map_err(|e| QueueError::RedisOperationFailed {
                    operation: "rpoplpush (recovery)".to_string(),
                    source: e,
                })?;
            if item.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            debug!(
                worker_id = %self.worker_id,
                count = recovered,
                "Recovered in-progress jobs to primary queue"
            );
        }
        Ok(recovered)
    }
}

#[async_trait]
impl<T> QueueAdapter<T> for RedisQueueAdapter<T>
where
    T: Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static,
{
    async fn pull(&self) -> Option<T> {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = ?e, "Failed to get Redis connection for pull");
                return None;
            }
        };

        let raw: Option<String> = match conn
            .rpoplpush(&self.primary_queue_name, &self.worker_queue_name)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = ?e, "Failed to pull job from Redis queue");
                return None;
            }
        };

        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(item) => {
                trace!(worker_id = %self.worker_id, "Pulled job from Redis queue");
                Some(item)
            }
            Err(e) => {
                error!(error = ?e, data = %raw, "Dropping malformed job payload");
                let _ = conn
                    .lrem::<_, _, ()>(&self.worker_queue_name, 1, &raw)
                    .await;
                None
            }
        }
    }

    async fn push(&self, work: T) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                queue_type: "redis".to_string(),
                details: e.to_string(),
            })?;

        let serialized = serde_json::to_string(&work)?;
        conn.lpush::<_, _, ()>(&self.primary_queue_name, &serialized)
            .await
            .map_err(|e| QueueError::RedisOperationFailed {
                operation: "lpush".to_string(),
                source: e,
            })?;
        Ok(())
    }

    async fn ack(&self, item: &T) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                queue_type: "redis".to_string(),
                details: e.to_string(),
            })?;

        let serialized = serde_json::to_string(item)?;
        let removed: i64 = conn
            .lrem(&self.worker_queue_name, 1, &serialized)
            .await
            .map_err(|e| QueueError::RedisOperationFailed {
                operation: "lrem (ack)".to_string(),
                source: e,
            })?;
        trace!(count = removed, "Acknowledged job");
        Ok(())
    }

    async fn depth(&self) -> Option<usize> {
        let mut conn = self.pool.get().await.ok()?;
        conn.llen::<_, usize>(&self.primary_queue_name).await.ok()
    }

    async fn is_healthy(&self) -> bool {
        match self.pool.get().await {
            Ok(mut conn) => deadpool_redis::redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .map(|response| response == "PONG")
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}
