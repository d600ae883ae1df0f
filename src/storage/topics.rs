//! Storage for tracked topics.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::storage::records::Topic;
use crate::storage::traits::StorageResult;

#[async_trait]
pub trait TopicStorage: Send + Sync {
    /// Active topics for a user, most recently updated first.
    async fn active_topics(&self, user_id: &str) -> StorageResult<Vec<Topic>>;

    async fn count_active(&self, user_id: &str) -> StorageResult<i64>;

    async fn upsert_topic(&self, topic: &Topic) -> StorageResult<()>;
}

pub struct PostgresTopicStorage {
    pool: Arc<PgPool>,
}

impl PostgresTopicStorage {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topics (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                keyword TEXT NOT NULL,
                language TEXT,
                min_likes BIGINT NOT NULL DEFAULT 0,
                exclude_words TEXT NOT NULL DEFAULT '[]',
                active BOOLEAN NOT NULL DEFAULT true,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_topics_user_active
            ON topics (user_id, updated_at DESC)
            WHERE active = true
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TopicRow {
    id: String,
    user_id: String,
    keyword: String,
    language: Option<String>,
    min_likes: i64,
    exclude_words: String,
    active: bool,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TopicRow {
    fn into_topic(self) -> Topic {
        Topic {
            id: self.id,
            user_id: self.user_id,
            keyword: self.keyword,
            language: self.language,
            min_likes: self.min_likes,
            exclude_words: serde_json::from_str(&self.exclude_words).unwrap_or_default(),
            active: self.active,
            updated_at: self.updated_at,
        }
    }
}

#[async_trait]
impl TopicStorage for PostgresTopicStorage {
    async fn active_topics(&self, user_id: &str) -> StorageResult<Vec<Topic>> {
        let rows = sqlx::query_as::<_, TopicRow>(
            r#"
            SELECT id, user_id, keyword, language, min_likes, exclude_words, active, updated_at
            FROM topics
            WHERE user_id = $1 AND active = true
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows.into_iter().map(TopicRow::into_topic).collect())
    }

    async fn count_active(&self, user_id: &str) -> StorageResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM topics WHERE user_id = $1 AND active = true",
        )
        .bind(user_id)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(count)
    }

    async fn upsert_topic(&self, topic: &Topic) -> StorageResult<()> {
        let exclude_words = serde_json::to_string(&topic.exclude_words).unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO topics (id, user_id, keyword, language, min_likes, exclude_words, active, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                keyword = EXCLUDED.keyword,
                language = EXCLUDED.language,
                min_likes = EXCLUDED.min_likes,
                exclude_words = EXCLUDED.exclude_words,
                active = EXCLUDED.active,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&topic.id)
        .bind(&topic.user_id)
        .bind(&topic.keyword)
        .bind(&topic.language)
        .bind(topic.min_likes)
        .bind(exclude_words)
        .bind(topic.active)
        .bind(topic.updated_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

/// In-memory implementation for single-instance runs and tests.
#[derive(Default)]
pub struct MemoryTopicStorage {
    topics: tokio::sync::RwLock<HashMap<String, Topic>>,
}

impl MemoryTopicStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TopicStorage for MemoryTopicStorage {
    async fn active_topics(&self, user_id: &str) -> StorageResult<Vec<Topic>> {
        let topics = self.topics.read().await;
        let mut result: Vec<Topic> = topics
            .values()
            .filter(|t| t.user_id == user_id && t.active)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(result)
    }

    async fn count_active(&self, user_id: &str) -> StorageResult<i64> {
        let topics = self.topics.read().await;
        Ok(topics
            .values()
            .filter(|t| t.user_id == user_id && t.active)
            .count() as i64)
    }

    async fn upsert_topic(&self, topic: &Topic) -> StorageResult<()> {
        self.topics
            .write()
            .await
            .insert(topic.id.clone(), topic.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn topic(id: &str, user: &str, active: bool, age_minutes: i64) -> Topic {
        Topic {
            id: id.to_string(),
            user_id: user.to_string(),
            keyword: format!("keyword-{id}"),
            language: Some("en".to_string()),
            min_likes: 5,
            exclude_words: vec![],
            active,
            updated_at: Utc::now() - chrono::Duration::minutes(age_minutes),
        }
    }

    #[tokio::test]
    async fn active_topics_are_ordered_most_recent_first() {
        let storage = MemoryTopicStorage::new();
        storage.upsert_topic(&topic("a", "u1", true, 30)).await.unwrap();
        storage.upsert_topic(&topic("b", "u1", true, 5)).await.unwrap();
        storage.upsert_topic(&topic("c", "u1", false, 1)).await.unwrap();
        storage.upsert_topic(&topic("d", "u2", true, 1)).await.unwrap();

        let topics = storage.active_topics("u1").await.unwrap();
        assert_eq!(
            topics.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
        assert_eq!(storage.count_active("u1").await.unwrap(), 2);
    }
}
