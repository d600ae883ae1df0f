//! Append-only action log. A write-only sink: the core never reads it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;

use crate::storage::records::ActionLogEntry;
use crate::storage::traits::StorageResult;

#[async_trait]
pub trait AuditStorage: Send + Sync {
    async fn log(&self, entry: &ActionLogEntry) -> StorageResult<()>;
}

pub struct PostgresAuditStorage {
    pool: Arc<PgPool>,
}

impl PostgresAuditStorage {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS action_logs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT,
                context TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

#[async_trait]
impl AuditStorage for PostgresAuditStorage {
    async fn log(&self, entry: &ActionLogEntry) -> StorageResult<()> {
        let context = serde_json::to_string(&entry.context).unwrap_or_else(|_| "{}".to_string());
        sqlx::query(
            r#"
            INSERT INTO action_logs (id, user_id, action, status, message, context)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(ulid::Ulid::new().to_string())
        .bind(&entry.user_id)
        .bind(&entry.action)
        .bind(entry.status.as_str())
        .bind(&entry.message)
        .bind(context)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}

/// Recorded log line kept by the in-memory sink, with its receive time.
#[derive(Debug, Clone)]
pub struct RecordedLog {
    pub entry: ActionLogEntry,
    pub at: DateTime<Utc>,
}

/// In-memory implementation; tests assert against the recorded entries.
#[derive(Default)]
pub struct MemoryAuditStorage {
    entries: tokio::sync::RwLock<Vec<RecordedLog>>,
}

impl MemoryAuditStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<RecordedLog> {
        self.entries.read().await.clone()
    }

    pub async fn entries_for_action(&self, action: &str) -> Vec<RecordedLog> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|log| log.entry.action == action)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditStorage for MemoryAuditStorage {
    async fn log(&self, entry: &ActionLogEntry) -> StorageResult<()> {
        self.entries.write().await.push(RecordedLog {
            entry: entry.clone(),
            at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::records::{LogContext, LogStatus};

    #[tokio::test]
    async fn entries_are_appended_in_order() {
        let storage = MemoryAuditStorage::new();
        for action in ["discovery", "engagement"] {
            storage
                .log(&ActionLogEntry {
                    user_id: "u1".to_string(),
                    action: action.to_string(),
                    status: LogStatus::Success,
                    message: None,
                    context: LogContext::None,
                })
                .await
                .unwrap();
        }

        let entries = storage.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry.action, "discovery");
        assert_eq!(entries[1].entry.action, "engagement");
        assert_eq!(storage.entries_for_action("discovery").await.len(), 1);
    }
}
