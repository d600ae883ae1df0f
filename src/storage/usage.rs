//! Append-only usage event ledger.
//!
//! Every cap check counts rows from this ledger; an event that fails to
//! persist must fail the caller, since silent under-counting would let a run
//! sail past its caps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;

use crate::storage::records::{UsageAction, UsageEvent, UsageMeta};
use crate::storage::traits::StorageResult;

#[async_trait]
pub trait UsageStorage: Send + Sync {
    async fn record(
        &self,
        user_id: &str,
        action: UsageAction,
        meta: UsageMeta,
    ) -> StorageResult<()>;

    async fn count_since(
        &self,
        user_id: &str,
        action: UsageAction,
        since: DateTime<Utc>,
    ) -> StorageResult<i64>;

    async fn count_any_since(
        &self,
        user_id: &str,
        actions: &[UsageAction],
        since: DateTime<Utc>,
    ) -> StorageResult<i64>;
}

pub struct PostgresUsageStorage {
    pool: Arc<PgPool>,
}

impl PostgresUsageStorage {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_events (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                meta TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_usage_events_window
            ON usage_events (user_id, action, created_at DESC)
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

#[async_trait]
impl UsageStorage for PostgresUsageStorage {
    async fn record(
        &self,
        user_id: &str,
        action: UsageAction,
        meta: UsageMeta,
    ) -> StorageResult<()> {
        let meta_json = serde_json::to_string(&meta).unwrap_or_else(|_| "{}".to_string());
        sqlx::query(
            "INSERT INTO usage_events (id, user_id, action, meta) VALUES ($1, $2, $3, $4)",
        )
        .bind(ulid::Ulid::new().to_string())
        .bind(user_id)
        .bind(action.as_str())
        .bind(meta_json)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn count_since(
        &self,
        user_id: &str,
        action: UsageAction,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM usage_events
            WHERE user_id = $1 AND action = $2 AND created_at >= $3
            "#,
        )
        .bind(user_id)
        .bind(action.as_str())
        .bind(since)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(count)
    }

    async fn count_any_since(
        &self,
        user_id: &str,
        actions: &[UsageAction],
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let action_names: Vec<String> = actions
            .iter()
            .map(|action| action.as_str().to_string())
            .collect();
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM usage_events
            WHERE user_id = $1 AND action = ANY($2) AND created_at >= $3
            "#,
        )
        .bind(user_id)
        .bind(&action_names)
        .bind(since)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(count)
    }
}

/// In-memory implementation for single-instance runs and tests.
#[derive(Default)]
pub struct MemoryUsageStorage {
    events: tokio::sync::RwLock<Vec<UsageEvent>>,
}

impl MemoryUsageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event with an explicit timestamp; used by tests to build a
    /// ledger that straddles window boundaries.
    pub async fn record_at(
        &self,
        user_id: &str,
        action: UsageAction,
        meta: UsageMeta,
        created_at: DateTime<Utc>,
    ) {
        self.events.write().await.push(UsageEvent {
            id: ulid::Ulid::new().to_string(),
            user_id: user_id.to_string(),
            action,
            created_at,
            meta,
        });
    }

    pub async fn all_events(&self) -> Vec<UsageEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl UsageStorage for MemoryUsageStorage {
    async fn record(
        &self,
        user_id: &str,
        action: UsageAction,
        meta: UsageMeta,
    ) -> StorageResult<()> {
        self.record_at(user_id, action, meta, Utc::now()).await;
        Ok(())
    }

    async fn count_since(
        &self,
        user_id: &str,
        action: UsageAction,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.user_id == user_id && e.action == action && e.created_at >= since)
            .count() as i64)
    }

    async fn count_any_since(
        &self,
        user_id: &str,
        actions: &[UsageAction],
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| {
                e.user_id == user_id && actions.contains(&e.action) && e.created_at >= since
            })
            .count() as i64)
    }
}
