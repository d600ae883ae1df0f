//! Storage for published generated posts.
//!
//! Rows are created only after a successful publish; the recent-text window
//! feeds the bounded dedup check in the auto-post processor.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::storage::records::{GeneratedPost, NewGeneratedPost};
use crate::storage::traits::StorageResult;

#[async_trait]
pub trait GeneratedPostStorage: Send + Sync {
    /// Most recent generated texts, newest first.
    async fn recent_texts(&self, user_id: &str, limit: i64) -> StorageResult<Vec<String>>;

    async fn insert_post(&self, post: &NewGeneratedPost) -> StorageResult<GeneratedPost>;
}

pub struct PostgresGeneratedPostStorage {
    pool: Arc<PgPool>,
}

impl PostgresGeneratedPostStorage {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS generated_posts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                text TEXT NOT NULL,
                thread_parts TEXT NOT NULL DEFAULT '[]',
                x_post_id TEXT,
                source_topic TEXT,
                status TEXT NOT NULL DEFAULT 'posted',
                posted_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_generated_posts_recent
            ON generated_posts (user_id, created_at DESC)
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

#[async_trait]
impl GeneratedPostStorage for PostgresGeneratedPostStorage {
    async fn recent_texts(&self, user_id: &str, limit: i64) -> StorageResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT text
            FROM generated_posts
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows.into_iter().map(|(text,)| text).collect())
    }

    async fn insert_post(&self, post: &NewGeneratedPost) -> StorageResult<GeneratedPost> {
        let id = ulid::Ulid::new().to_string();
        let now = Utc::now();
        let thread_parts = serde_json::to_string(&post.thread_parts).unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO generated_posts
                (id, user_id, text, thread_parts, x_post_id, source_topic, status, posted_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'posted', $7, $7)
            "#,
        )
        .bind(&id)
        .bind(&post.user_id)
        .bind(&post.text)
        .bind(thread_parts)
        .bind(&post.x_post_id)
        .bind(&post.source_topic)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;

        Ok(GeneratedPost {
            id,
            user_id: post.user_id.clone(),
            text: post.text.clone(),
            thread_parts: post.thread_parts.clone(),
            x_post_id: Some(post.x_post_id.clone()),
            source_topic: post.source_topic.clone(),
            status: "posted".to_string(),
            posted_at: Some(now),
            created_at: now,
        })
    }
}

/// In-memory implementation for single-instance runs and tests.
#[derive(Default)]
pub struct MemoryGeneratedPostStorage {
    posts: tokio::sync::RwLock<HashMap<String, GeneratedPost>>,
}

impl MemoryGeneratedPostStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GeneratedPostStorage for MemoryGeneratedPostStorage {
    async fn recent_texts(&self, user_id: &str, limit: i64) -> StorageResult<Vec<String>> {
        let posts = self.posts.read().await;
        let mut recent: Vec<&GeneratedPost> =
            posts.values().filter(|p| p.user_id == user_id).collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(recent
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|p| p.text.clone())
            .collect())
    }

    async fn insert_post(&self, post: &NewGeneratedPost) -> StorageResult<GeneratedPost> {
        let id = ulid::Ulid::new().to_string();
        let now = Utc::now();
        let stored = GeneratedPost {
            id: id.clone(),
            user_id: post.user_id.clone(),
            text: post.text.clone(),
            thread_parts: post.thread_parts.clone(),
            x_post_id: Some(post.x_post_id.clone()),
            source_topic: post.source_topic.clone(),
            status: "posted".to_string(),
            posted_at: Some(now),
            created_at: now,
        };
        self.posts.write().await.insert(id, stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_post(user: &str, text: &str) -> NewGeneratedPost {
        NewGeneratedPost {
            user_id: user.to_string(),
            text: text.to_string(),
            thread_parts: vec![text.to_string()],
            x_post_id: format!("x-{text}"),
            source_topic: Some("saas growth".to_string()),
        }
    }

    #[tokio::test]
    async fn recent_texts_are_newest_first_and_bounded() {
        let storage = MemoryGeneratedPostStorage::new();
        for i in 0..5 {
            storage.insert_post(&new_post("u1", &format!("post {i}"))).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        storage.insert_post(&new_post("u2", "other user")).await.unwrap();

        let recent = storage.recent_texts("u1", 3).await.unwrap();
        assert_eq!(recent, vec!["post 4", "post 3", "post 2"]);
    }
}
