//! Storage for users, X connections, and BYOA app credentials.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::StorageError;
use crate::storage::records::{AppCredential, Connection, User};
use crate::storage::traits::StorageResult;

#[async_trait]
pub trait AccountStorage: Send + Sync {
    async fn get_user(&self, user_id: &str) -> StorageResult<Option<User>>;

    async fn upsert_user(&self, user: &User) -> StorageResult<()>;

    /// User ids that currently hold an X connection, for scheduler fan-out.
    async fn connected_user_ids(&self) -> StorageResult<Vec<String>>;

    async fn get_connection(&self, user_id: &str) -> StorageResult<Option<Connection>>;

    async fn upsert_connection(&self, connection: &Connection) -> StorageResult<()>;

    /// Persist refreshed token material on an existing connection.
    async fn update_connection_tokens(
        &self,
        user_id: &str,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
        scope: Option<&str>,
    ) -> StorageResult<()>;

    async fn get_app_credential(&self, user_id: &str) -> StorageResult<Option<AppCredential>>;

    async fn upsert_app_credential(&self, credential: &AppCredential) -> StorageResult<()>;
}

pub struct PostgresAccountStorage {
    pool: Arc<PgPool>,
}

impl PostgresAccountStorage {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                internal_plan TEXT NOT NULL DEFAULT 'FREE',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS x_connections (
                user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                x_user_id TEXT NOT NULL,
                handle TEXT,
                access_token_enc TEXT NOT NULL,
                refresh_token_enc TEXT,
                token_expires_at TIMESTAMPTZ,
                scope TEXT,
                x_paid_tier TEXT NOT NULL DEFAULT 'FREE',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS x_app_credentials (
                user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                client_id_enc TEXT NOT NULL,
                client_secret_enc TEXT,
                callback_url TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    internal_plan: String,
}

impl UserRow {
    fn into_user(self) -> StorageResult<User> {
        Ok(User {
            id: self.id,
            email: self.email,
            internal_plan: self.internal_plan.parse()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    user_id: String,
    x_user_id: String,
    handle: Option<String>,
    access_token_enc: String,
    refresh_token_enc: Option<String>,
    token_expires_at: Option<DateTime<Utc>>,
    scope: Option<String>,
    x_paid_tier: String,
}

impl ConnectionRow {
    fn into_connection(self) -> StorageResult<Connection> {
        Ok(Connection {
            user_id: self.user_id,
            x_user_id: self.x_user_id,
            handle: self.handle,
            access_token_enc: self.access_token_enc,
            refresh_token_enc: self.refresh_token_enc,
            token_expires_at: self.token_expires_at,
            scope: self.scope,
            x_paid_tier: self.x_paid_tier.parse()?,
        })
    }
}

#[async_trait]
impl AccountStorage for PostgresAccountStorage {
    async fn get_user(&self, user_id: &str) -> StorageResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, internal_plan FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(UserRow::into_user).transpose()
    }

    async fn upsert_user(&self, user: &User) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, internal_plan)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                email = EXCLUDED.email,
                internal_plan = EXCLUDED.internal_plan
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(user.internal_plan.as_str())
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn connected_user_ids(&self) -> StorageResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT user_id FROM x_connections")
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get_connection(&self, user_id: &str) -> StorageResult<Option<Connection>> {
        let row = sqlx::query_as::<_, ConnectionRow>(
            r#"
            SELECT user_id, x_user_id, handle, access_token_enc, refresh_token_enc,
                   token_expires_at, scope, x_paid_tier
            FROM x_connections
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(ConnectionRow::into_connection).transpose()
    }

    async fn upsert_connection(&self, connection: &Connection) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO x_connections
                (user_id, x_user_id, handle, access_token_enc, refresh_token_enc,
                 token_expires_at, scope, x_paid_tier)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id) DO UPDATE SET
                x_user_id = EXCLUDED.x_user_id,
                handle = EXCLUDED.handle,
                access_token_enc = EXCLUDED.access_token_enc,
                refresh_token_enc = EXCLUDED.refresh_token_enc,
                token_expires_at = EXCLUDED.token_expires_at,
                scope = EXCLUDED.scope,
                x_paid_tier = EXCLUDED.x_paid_tier,
                updated_at = NOW()
            "#,
        )
        .bind(&connection.user_id)
        .bind(&connection.x_user_id)
        .bind(&connection.handle)
        .bind(&connection.access_token_enc)
        .bind(&connection.refresh_token_enc)
        .bind(connection.token_expires_at)
        .bind(&connection.scope)
        .bind(connection.x_paid_tier.as_str())
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn update_connection_tokens(
        &self,
        user_id: &str,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
        scope: Option<&str>,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE x_connections
            SET access_token_enc = $2,
                refresh_token_enc = COALESCE($3, refresh_token_enc),
                token_expires_at = $4,
                scope = COALESCE($5, scope),
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(access_token_enc)
        .bind(refresh_token_enc)
        .bind(token_expires_at)
        .bind(scope)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn get_app_credential(&self, user_id: &str) -> StorageResult<Option<AppCredential>> {
        let row: Option<(String, String, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT user_id, client_id_enc, client_secret_enc, callback_url
            FROM x_app_credentials
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(
            |(user_id, client_id_enc, client_secret_enc, callback_url)| AppCredential {
                user_id,
                client_id_enc,
                client_secret_enc,
                callback_url,
            },
        ))
    }

    async fn upsert_app_credential(&self, credential: &AppCredential) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO x_app_credentials (user_id, client_id_enc, client_secret_enc, callback_url)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE SET
                client_id_enc = EXCLUDED.client_id_enc,
                client_secret_enc = EXCLUDED.client_secret_enc,
                callback_url = EXCLUDED.callback_url,
                updated_at = NOW()
            "#,
        )
        .bind(&credential.user_id)
        .bind(&credential.client_id_enc)
        .bind(&credential.client_secret_enc)
        .bind(&credential.callback_url)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

/// In-memory implementation for single-instance runs and tests.
#[derive(Default)]
pub struct MemoryAccountStorage {
    users: tokio::sync::RwLock<HashMap<String, User>>,
    connections: tokio::sync::RwLock<HashMap<String, Connection>>,
    credentials: tokio::sync::RwLock<HashMap<String, AppCredential>>,
}

impl MemoryAccountStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStorage for MemoryAccountStorage {
    async fn get_user(&self, user_id: &str) -> StorageResult<Option<User>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn upsert_user(&self, user: &User) -> StorageResult<()> {
        self.users
            .write()
            .await
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn connected_user_ids(&self) -> StorageResult<Vec<String>> {
        Ok(self.connections.read().await.keys().cloned().collect())
    }

    async fn get_connection(&self, user_id: &str) -> StorageResult<Option<Connection>> {
        Ok(self.connections.read().await.get(user_id).cloned())
    }

    async fn upsert_connection(&self, connection: &Connection) -> StorageResult<()> {
        self.connections
            .write()
            .await
            .insert(connection.user_id.clone(), connection.clone());
        Ok(())
    }

    async fn update_connection_tokens(
        &self,
        user_id: &str,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
        scope: Option<&str>,
    ) -> StorageResult<()> {
        let mut connections = self.connections.write().await;
        let connection =
            connections
                .get_mut(user_id)
                .ok_or_else(|| StorageError::InvalidInput {
                    details: format!("no connection for user {}", user_id),
                })?;
        connection.access_token_enc = access_token_enc.to_string();
        if let Some(refresh) = refresh_token_enc {
            connection.refresh_token_enc = Some(refresh.to_string());
        }
        connection.token_expires_at = token_expires_at;
        if let Some(scope) = scope {
            connection.scope = Some(scope.to_string());
        }
        Ok(())
    }

    async fn get_app_credential(&self, user_id: &str) -> StorageResult<Option<AppCredential>> {
        Ok(self.credentials.read().await.get(user_id).cloned())
    }

    async fn upsert_app_credential(&self, credential: &AppCredential) -> StorageResult<()> {
        self.credentials
            .write()
            .await
            .insert(credential.user_id.clone(), credential.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::records::{InternalPlan, XPaidTier};

    fn test_connection(user_id: &str) -> Connection {
        Connection {
            user_id: user_id.to_string(),
            x_user_id: "x-1".to_string(),
            handle: Some("builder".to_string()),
            access_token_enc: "enc-access".to_string(),
            refresh_token_enc: Some("enc-refresh".to_string()),
            token_expires_at: None,
            scope: Some("tweet.read".to_string()),
            x_paid_tier: XPaidTier::Basic,
        }
    }

    #[tokio::test]
    async fn connection_round_trip_and_token_update() {
        let storage = MemoryAccountStorage::new();
        let user = User {
            id: "u1".to_string(),
            email: "demo@xgrowth.app".to_string(),
            internal_plan: InternalPlan::Pro,
        };
        storage.upsert_user(&user).await.unwrap();
        storage
            .upsert_connection(&test_connection("u1"))
            .await
            .unwrap();

        assert_eq!(storage.connected_user_ids().await.unwrap(), vec!["u1"]);

        let expires = Utc::now() + chrono::Duration::hours(2);
        storage
            .update_connection_tokens("u1", "enc-new", None, Some(expires), None)
            .await
            .unwrap();

        let connection = storage.get_connection("u1").await.unwrap().unwrap();
        assert_eq!(connection.access_token_enc, "enc-new");
        // Absent refresh token keeps the previous one.
        assert_eq!(connection.refresh_token_enc.as_deref(), Some("enc-refresh"));
        assert_eq!(connection.token_expires_at, Some(expires));
        assert_eq!(connection.scope.as_deref(), Some("tweet.read"));
    }

    #[tokio::test]
    async fn token_update_requires_existing_connection() {
        let storage = MemoryAccountStorage::new();
        let result = storage
            .update_connection_tokens("ghost", "enc", None, None, None)
            .await;
        assert!(result.is_err());
    }
}
