//! Storage for discovered candidates.
//!
//! Candidates are unique per (user_id, post_id). Discovery inserts them with
//! conflict suppression so concurrent runs for the same user cannot create
//! duplicates; engagement mutates reply/like/follow state in place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::StorageError;
use crate::storage::records::{Candidate, ModerationStatus, NewCandidate};
use crate::storage::traits::StorageResult;

#[async_trait]
pub trait CandidateStorage: Send + Sync {
    async fn find_by_post_id(
        &self,
        user_id: &str,
        post_id: &str,
    ) -> StorageResult<Option<Candidate>>;

    /// Insert a discovered candidate. Returns false when a candidate with the
    /// same (user, post) already exists; the insert is then a no-op.
    async fn insert_candidate(&self, candidate: &NewCandidate) -> StorageResult<bool>;

    /// Candidates not yet replied to, ordered by descending like count and
    /// then ascending discovery time.
    async fn pending_candidates(&self, user_id: &str, limit: i64) -> StorageResult<Vec<Candidate>>;

    /// Most recent reply texts, newest first.
    async fn recent_reply_texts(&self, user_id: &str, limit: i64) -> StorageResult<Vec<String>>;

    async fn reply_text_exists(&self, user_id: &str, reply_text: &str) -> StorageResult<bool>;

    async fn mark_replied(
        &self,
        candidate_id: &str,
        reply_text: &str,
        fingerprint: &str,
        replied_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn mark_liked(&self, candidate_id: &str, liked_at: DateTime<Utc>) -> StorageResult<()>;

    async fn mark_followed(
        &self,
        candidate_id: &str,
        followed_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn set_moderation_status(
        &self,
        candidate_id: &str,
        status: ModerationStatus,
    ) -> StorageResult<()>;
}

pub struct PostgresCandidateStorage {
    pool: Arc<PgPool>,
}

impl PostgresCandidateStorage {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candidates (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                post_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                author_handle TEXT,
                text TEXT NOT NULL,
                language TEXT,
                like_count BIGINT NOT NULL DEFAULT 0,
                discovered_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                reply_text TEXT,
                replied_at TIMESTAMPTZ,
                liked_at TIMESTAMPTZ,
                followed_at TIMESTAMPTZ,
                moderation_status TEXT NOT NULL DEFAULT 'UNREVIEWED',
                duplicate_fingerprint TEXT NOT NULL,
                UNIQUE (user_id, post_id)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_candidates_pending
            ON candidates (user_id, like_count DESC, discovered_at ASC)
            WHERE replied_at IS NULL
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct CandidateRow {
    id: String,
    user_id: String,
    post_id: String,
    author_id: String,
    author_handle: Option<String>,
    text: String,
    language: Option<String>,
    like_count: i64,
    discovered_at: DateTime<Utc>,
    reply_text: Option<String>,
    replied_at: Option<DateTime<Utc>>,
    liked_at: Option<DateTime<Utc>>,
    followed_at: Option<DateTime<Utc>>,
    moderation_status: String,
    duplicate_fingerprint: String,
}

impl CandidateRow {
    fn into_candidate(self) -> StorageResult<Candidate> {
        Ok(Candidate {
            id: self.id,
            user_id: self.user_id,
            post_id: self.post_id,
            author_id: self.author_id,
            author_handle: self.author_handle,
            text: self.text,
            language: self.language,
            like_count: self.like_count,
            discovered_at: self.discovered_at,
            reply_text: self.reply_text,
            replied_at: self.replied_at,
            liked_at: self.liked_at,
            followed_at: self.followed_at,
            moderation_status: self.moderation_status.parse()?,
            duplicate_fingerprint: self.duplicate_fingerprint,
        })
    }
}

const CANDIDATE_COLUMNS: &str = r#"id, user_id, post_id, author_id, author_handle, text, language,
    like_count, discovered_at, reply_text, replied_at, liked_at, followed_at,
    moderation_status, duplicate_fingerprint"#;

#[async_trait]
impl CandidateStorage for PostgresCandidateStorage {
    async fn find_by_post_id(
        &self,
        user_id: &str,
        post_id: &str,
    ) -> StorageResult<Option<Candidate>> {
        let row = sqlx::query_as::<_, CandidateRow>(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE user_id = $1 AND post_id = $2"
        ))
        .bind(user_id)
        .bind(post_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(CandidateRow::into_candidate).transpose()
    }

    async fn insert_candidate(&self, candidate: &NewCandidate) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO candidates
                (id, user_id, post_id, author_id, author_handle, text, language,
                 like_count, duplicate_fingerprint)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, post_id) DO NOTHING
            "#,
        )
        .bind(ulid::Ulid::new().to_string())
        .bind(&candidate.user_id)
        .bind(&candidate.post_id)
        .bind(&candidate.author_id)
        .bind(&candidate.author_handle)
        .bind(&candidate.text)
        .bind(&candidate.language)
        .bind(candidate.like_count)
        .bind(&candidate.duplicate_fingerprint)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending_candidates(&self, user_id: &str, limit: i64) -> StorageResult<Vec<Candidate>> {
        let rows = sqlx::query_as::<_, CandidateRow>(&format!(
            r#"
            SELECT {CANDIDATE_COLUMNS}
            FROM candidates
            WHERE user_id = $1 AND replied_at IS NULL
            ORDER BY like_count DESC, discovered_at ASC
            LIMIT $2
            "#
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter().map(CandidateRow::into_candidate).collect()
    }

    async fn recent_reply_texts(&self, user_id: &str, limit: i64) -> StorageResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT reply_text
            FROM candidates
            WHERE user_id = $1 AND reply_text IS NOT NULL
            ORDER BY replied_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows.into_iter().map(|(text,)| text).collect())
    }

    async fn reply_text_exists(&self, user_id: &str, reply_text: &str) -> StorageResult<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM candidates WHERE user_id = $1 AND reply_text = $2 LIMIT 1",
        )
        .bind(user_id)
        .bind(reply_text)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row.is_some())
    }

    async fn mark_replied(
        &self,
        candidate_id: &str,
        reply_text: &str,
        fingerprint: &str,
        replied_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE candidates
            SET reply_text = $2, replied_at = $3, moderation_status = 'PASSED',
                duplicate_fingerprint = $4
            WHERE id = $1
            "#,
        )
        .bind(candidate_id)
        .bind(reply_text)
        .bind(replied_at)
        .bind(fingerprint)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn mark_liked(&self, candidate_id: &str, liked_at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query("UPDATE candidates SET liked_at = $2 WHERE id = $1")
            .bind(candidate_id)
            .bind(liked_at)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn mark_followed(
        &self,
        candidate_id: &str,
        followed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        sqlx::query("UPDATE candidates SET followed_at = $2 WHERE id = $1")
            .bind(candidate_id)
            .bind(followed_at)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn set_moderation_status(
        &self,
        candidate_id: &str,
        status: ModerationStatus,
    ) -> StorageResult<()> {
        sqlx::query("UPDATE candidates SET moderation_status = $2 WHERE id = $1")
            .bind(candidate_id)
            .bind(status.as_str())
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }
}

/// In-memory implementation for single-instance runs and tests.
#[derive(Default)]
pub struct MemoryCandidateStorage {
    candidates: tokio::sync::RwLock<HashMap<String, Candidate>>,
}

impl MemoryCandidateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, candidate_id: &str, apply: F) -> StorageResult<()>
    where
        F: FnOnce(&mut Candidate),
    {
        let mut candidates = self.candidates.write().await;
        let candidate =
            candidates
                .get_mut(candidate_id)
                .ok_or_else(|| StorageError::InvalidInput {
                    details: format!("no candidate {}", candidate_id),
                })?;
        apply(candidate);
        Ok(())
    }
}

#[async_trait]
impl CandidateStorage for MemoryCandidateStorage {
    async fn find_by_post_id(
        &self,
        user_id: &str,
        post_id: &str,
    ) -> StorageResult<Option<Candidate>> {
        let candidates = self.candidates.read().await;
        Ok(candidates
            .values()
            .find(|c| c.user_id == user_id && c.post_id == post_id)
            .cloned())
    }

    async fn insert_candidate(&self, candidate: &NewCandidate) -> StorageResult<bool> {
        let mut candidates = self.candidates.write().await;
        let exists = candidates
            .values()
            .any(|c| c.user_id == candidate.user_id && c.post_id == candidate.post_id);
        if exists {
            return Ok(false);
        }
        let id = ulid::Ulid::new().to_string();
        candidates.insert(
            id.clone(),
            Candidate {
                id,
                user_id: candidate.user_id.clone(),
                post_id: candidate.post_id.clone(),
                author_id: candidate.author_id.clone(),
                author_handle: candidate.author_handle.clone(),
                text: candidate.text.clone(),
                language: candidate.language.clone(),
                like_count: candidate.like_count,
                discovered_at: Utc::now(),
                reply_text: None,
                replied_at: None,
                liked_at: None,
                followed_at: None,
                moderation_status: ModerationStatus::Unreviewed,
                duplicate_fingerprint: candidate.duplicate_fingerprint.clone(),
            },
        );
        Ok(true)
    }

    async fn pending_candidates(&self, user_id: &str, limit: i64) -> StorageResult<Vec<Candidate>> {
        let candidates = self.candidates.read().await;
        let mut pending: Vec<Candidate> = candidates
            .values()
            .filter(|c| c.user_id == user_id && c.replied_at.is_none())
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.like_count
                .cmp(&a.like_count)
                .then(a.discovered_at.cmp(&b.discovered_at))
        });
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn recent_reply_texts(&self, user_id: &str, limit: i64) -> StorageResult<Vec<String>> {
        let candidates = self.candidates.read().await;
        let mut replied: Vec<&Candidate> = candidates
            .values()
            .filter(|c| c.user_id == user_id && c.reply_text.is_some())
            .collect();
        replied.sort_by(|a, b| b.replied_at.cmp(&a.replied_at));
        Ok(replied
            .into_iter()
            .take(limit.max(0) as usize)
            .filter_map(|c| c.reply_text.clone())
            .collect())
    }

    async fn reply_text_exists(&self, user_id: &str, reply_text: &str) -> StorageResult<bool> {
        let candidates = self.candidates.read().await;
        Ok(candidates
            .values()
            .any(|c| c.user_id == user_id && c.reply_text.as_deref() == Some(reply_text)))
    }

    async fn mark_replied(
        &self,
        candidate_id: &str,
        reply_text: &str,
        fingerprint: &str,
        replied_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.update(candidate_id, |c| {
            c.reply_text = Some(reply_text.to_string());
            c.replied_at = Some(replied_at);
            c.moderation_status = ModerationStatus::Passed;
            c.duplicate_fingerprint = fingerprint.to_string();
        })
        .await
    }

    async fn mark_liked(&self, candidate_id: &str, liked_at: DateTime<Utc>) -> StorageResult<()> {
        self.update(candidate_id, |c| c.liked_at = Some(liked_at)).await
    }

    async fn mark_followed(
        &self,
        candidate_id: &str,
        followed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.update(candidate_id, |c| c.followed_at = Some(followed_at))
            .await
    }

    async fn set_moderation_status(
        &self,
        candidate_id: &str,
        status: ModerationStatus,
    ) -> StorageResult<()> {
        self.update(candidate_id, |c| c.moderation_status = status)
            .await
    }
}
