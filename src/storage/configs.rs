//! Storage for per-user reply and auto-post configuration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::StorageError;
use crate::storage::records::{AutoPostConfig, ReplyConfig};
use crate::storage::traits::StorageResult;

#[async_trait]
pub trait ConfigStorage: Send + Sync {
    async fn reply_config(&self, user_id: &str) -> StorageResult<Option<ReplyConfig>>;

    async fn upsert_reply_config(&self, config: &ReplyConfig) -> StorageResult<()>;

    async fn auto_post_config(&self, user_id: &str) -> StorageResult<Option<AutoPostConfig>>;

    async fn upsert_auto_post_config(&self, config: &AutoPostConfig) -> StorageResult<()>;

    /// Advance the auto-post run marker. Written after every attempted run,
    /// whether or not a post succeeded.
    async fn set_last_run_at(&self, user_id: &str, at: DateTime<Utc>) -> StorageResult<()>;
}

pub struct PostgresConfigStorage {
    pool: Arc<PgPool>,
}

impl PostgresConfigStorage {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reply_configs (
                user_id TEXT PRIMARY KEY,
                tone TEXT NOT NULL DEFAULT 'PROFESSIONAL',
                cta_style TEXT NOT NULL DEFAULT 'SOFT',
                bio_context TEXT,
                like_on_reply BOOLEAN NOT NULL DEFAULT true,
                follow_on_reply BOOLEAN NOT NULL DEFAULT false
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auto_post_configs (
                user_id TEXT PRIMARY KEY,
                topics TEXT NOT NULL DEFAULT '[]',
                frequency_minutes BIGINT NOT NULL DEFAULT 240,
                window_start TEXT NOT NULL DEFAULT '09:00',
                window_end TEXT NOT NULL DEFAULT '18:00',
                thread_mode BOOLEAN NOT NULL DEFAULT false,
                language TEXT NOT NULL DEFAULT 'en',
                enabled BOOLEAN NOT NULL DEFAULT false,
                last_run_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ReplyConfigRow {
    user_id: String,
    tone: String,
    cta_style: String,
    bio_context: Option<String>,
    like_on_reply: bool,
    follow_on_reply: bool,
}

impl ReplyConfigRow {
    fn into_config(self) -> StorageResult<ReplyConfig> {
        Ok(ReplyConfig {
            user_id: self.user_id,
            tone: self.tone.parse()?,
            cta_style: self.cta_style.parse()?,
            bio_context: self.bio_context,
            like_on_reply: self.like_on_reply,
            follow_on_reply: self.follow_on_reply,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AutoPostConfigRow {
    user_id: String,
    topics: String,
    frequency_minutes: i64,
    window_start: String,
    window_end: String,
    thread_mode: bool,
    language: String,
    enabled: bool,
    last_run_at: Option<DateTime<Utc>>,
}

impl AutoPostConfigRow {
    fn into_config(self) -> AutoPostConfig {
        AutoPostConfig {
            user_id: self.user_id,
            topics: serde_json::from_str(&self.topics).unwrap_or_default(),
            frequency_minutes: self.frequency_minutes,
            window_start: self.window_start,
            window_end: self.window_end,
            thread_mode: self.thread_mode,
            language: self.language,
            enabled: self.enabled,
            last_run_at: self.last_run_at,
        }
    }
}

#[async_trait]
impl ConfigStorage for PostgresConfigStorage {
    async fn reply_config(&self, user_id: &str) -> StorageResult<Option<ReplyConfig>> {
        let row = sqlx::query_as::<_, ReplyConfigRow>(
            r#"
            SELECT user_id, tone, cta_style, bio_context, like_on_reply, follow_on_reply
            FROM reply_configs
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(ReplyConfigRow::into_config).transpose()
    }

    async fn upsert_reply_config(&self, config: &ReplyConfig) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reply_configs (user_id, tone, cta_style, bio_context, like_on_reply, follow_on_reply)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE SET
                tone = EXCLUDED.tone,
                cta_style = EXCLUDED.cta_style,
                bio_context = EXCLUDED.bio_context,
                like_on_reply = EXCLUDED.like_on_reply,
                follow_on_reply = EXCLUDED.follow_on_reply
            "#,
        )
        .bind(&config.user_id)
        .bind(config.tone.as_str())
        .bind(config.cta_style.as_str())
        .bind(&config.bio_context)
        .bind(config.like_on_reply)
        .bind(config.follow_on_reply)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn auto_post_config(&self, user_id: &str) -> StorageResult<Option<AutoPostConfig>> {
        let row = sqlx::query_as::<_, AutoPostConfigRow>(
            r#"
            SELECT user_id, topics, frequency_minutes, window_start, window_end,
                   thread_mode, language, enabled, last_run_at
            FROM auto_post_configs
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(AutoPostConfigRow::into_config))
    }

    async fn upsert_auto_post_config(&self, config: &AutoPostConfig) -> StorageResult<()> {
        let topics = serde_json::to_string(&config.topics).unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO auto_post_configs
                (user_id, topics, frequency_minutes, window_start, window_end,
                 thread_mode, language, enabled, last_run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id) DO UPDATE SET
                topics = EXCLUDED.topics,
                frequency_minutes = EXCLUDED.frequency_minutes,
                window_start = EXCLUDED.window_start,
                window_end = EXCLUDED.window_end,
                thread_mode = EXCLUDED.thread_mode,
                language = EXCLUDED.language,
                enabled = EXCLUDED.enabled,
                last_run_at = EXCLUDED.last_run_at
            "#,
        )
        .bind(&config.user_id)
        .bind(topics)
        .bind(config.frequency_minutes)
        .bind(&config.window_start)
        .bind(&config.window_end)
        .bind(config.thread_mode)
        .bind(&config.language)
        .bind(config.enabled)
        .bind(config.last_run_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn set_last_run_at(&self, user_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query("UPDATE auto_post_configs SET last_run_at = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(at)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }
}

/// In-memory implementation for single-instance runs and tests.
#[derive(Default)]
pub struct MemoryConfigStorage {
    reply_configs: tokio::sync::RwLock<HashMap<String, ReplyConfig>>,
    auto_post_configs: tokio::sync::RwLock<HashMap<String, AutoPostConfig>>,
}

impl MemoryConfigStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStorage for MemoryConfigStorage {
    async fn reply_config(&self, user_id: &str) -> StorageResult<Option<ReplyConfig>> {
        Ok(self.reply_configs.read().await.get(user_id).cloned())
    }

    async fn upsert_reply_config(&self, config: &ReplyConfig) -> StorageResult<()> {
        self.reply_configs
            .write()
            .await
            .insert(config.user_id.clone(), config.clone());
        Ok(())
    }

    async fn auto_post_config(&self, user_id: &str) -> StorageResult<Option<AutoPostConfig>> {
        Ok(self.auto_post_configs.read().await.get(user_id).cloned())
    }

    async fn upsert_auto_post_config(&self, config: &AutoPostConfig) -> StorageResult<()> {
        self.auto_post_configs
            .write()
            .await
            .insert(config.user_id.clone(), config.clone());
        Ok(())
    }

    async fn set_last_run_at(&self, user_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        let mut configs = self.auto_post_configs.write().await;
        let config = configs
            .get_mut(user_id)
            .ok_or_else(|| StorageError::InvalidInput {
                details: format!("no auto-post config for user {}", user_id),
            })?;
        config.last_run_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn last_run_marker_is_persisted() {
        let storage = MemoryConfigStorage::new();
        storage
            .upsert_auto_post_config(&AutoPostConfig {
                user_id: "u1".to_string(),
                topics: vec!["saas growth".to_string()],
                frequency_minutes: 240,
                window_start: "09:00".to_string(),
                window_end: "18:00".to_string(),
                thread_mode: false,
                language: "en".to_string(),
                enabled: true,
                last_run_at: None,
            })
            .await
            .unwrap();

        let at = Utc::now();
        storage.set_last_run_at("u1", at).await.unwrap();
        let config = storage.auto_post_config("u1").await.unwrap().unwrap();
        assert_eq!(config.last_run_at, Some(at));
    }
}
