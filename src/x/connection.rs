//! Per-user access token lifecycle.
//!
//! Returns the stored token while it is comfortably valid, and otherwise
//! refreshes it against the X authorization server, walking the ordered
//! client-authentication strategies until one succeeds. Refreshed material is
//! re-encrypted and persisted before the fresh token is handed out.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::constants::TOKEN_EXPIRY_MARGIN_SECS;
use crate::errors::EngineError;
use crate::secrets::SecretsCodec;
use crate::storage::AccountStorage;
use crate::storage::records::Connection;
use crate::x::client::XApi;
use crate::x::oauth::{
    AppOAuthCredentials, is_likely_client_id, normalize_client_id, refresh_strategies,
};

/// A usable bearer token plus the external account it belongs to.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub access_token: String,
    pub x_user_id: String,
}

pub struct TokenManager {
    accounts: Arc<dyn AccountStorage>,
    secrets: Arc<dyn SecretsCodec>,
    api: Arc<dyn XApi>,
    default_credentials: Option<AppOAuthCredentials>,
}

impl TokenManager {
    pub fn new(
        accounts: Arc<dyn AccountStorage>,
        secrets: Arc<dyn SecretsCodec>,
        api: Arc<dyn XApi>,
        default_credentials: Option<AppOAuthCredentials>,
    ) -> Self {
        Self {
            accounts,
            secrets,
            api,
            default_credentials,
        }
    }

    /// Resolve the OAuth app credentials to use for this user: their BYOA
    /// credential when present and plausible, otherwise the process defaults.
    async fn resolve_app_credentials(&self, user_id: &str) -> Result<AppOAuthCredentials> {
        if let Some(byoa) = self.accounts.get_app_credential(user_id).await? {
            let client_id = normalize_client_id(&self.secrets.decrypt(&byoa.client_id_enc)?);
            if is_likely_client_id(&client_id) {
                let client_secret = match &byoa.client_secret_enc {
                    Some(enc) => Some(self.secrets.decrypt(enc)?),
                    None => self
                        .default_credentials
                        .as_ref()
                        .and_then(|d| d.client_secret.clone()),
                };
                let callback_url = byoa.callback_url.clone().or_else(|| {
                    self.default_credentials
                        .as_ref()
                        .and_then(|d| d.callback_url.clone())
                });
                return Ok(AppOAuthCredentials {
                    client_id,
                    client_secret,
                    callback_url,
                });
            }
            debug!(user_id = %user_id, "BYOA client id failed sanity check, using defaults");
        }

        self.default_credentials
            .clone()
            .filter(|creds| is_likely_client_id(&creds.client_id))
            .ok_or_else(|| EngineError::MissingAppCredentials.into())
    }

    async fn refresh(&self, user_id: &str, connection: &Connection) -> Result<AccessGrant> {
        let refresh_token_enc = connection
            .refresh_token_enc
            .as_deref()
            .ok_or(EngineError::ReauthRequired)?;
        let refresh_token = self.secrets.decrypt(refresh_token_enc)?;
        let creds = self.resolve_app_credentials(user_id).await?;

        let mut attempts = Vec::new();
        for strategy in refresh_strategies(&creds) {
            match self.api.refresh_access_token(&refresh_token, &strategy).await {
                Ok(token) => {
                    debug!(
                        user_id = %user_id,
                        strategy = strategy.label(),
                        "Token refresh succeeded"
                    );

                    let access_token_enc = self.secrets.encrypt(&token.access_token)?;
                    let refresh_token_enc = token
                        .refresh_token
                        .as_deref()
                        .map(|value| self.secrets.encrypt(value))
                        .transpose()?;
                    let expires_at = token
                        .expires_in
                        .map(|seconds| Utc::now() + Duration::seconds(seconds));

                    self.accounts
                        .update_connection_tokens(
                            user_id,
                            &access_token_enc,
                            refresh_token_enc.as_deref(),
                            expires_at,
                            token.scope.as_deref(),
                        )
                        .await?;

                    info!(user_id = %user_id, "X access token refreshed");
                    return Ok(AccessGrant {
                        access_token: token.access_token,
                        x_user_id: connection.x_user_id.clone(),
                    });
                }
                Err(err) => {
                    warn!(
                        user_id = %user_id,
                        strategy = strategy.label(),
                        error = %err,
                        "Token refresh strategy failed"
                    );
                    attempts.push(format!("{}: {}", strategy.label(), err));
                }
            }
        }

        Err(EngineError::TokenRefreshFailed { attempts }.into())
    }

    /// Return a valid bearer token for the user, refreshing when the stored
    /// one expires within the safety margin.
    pub async fn get_valid_access_token(&self, user_id: &str) -> Result<AccessGrant> {
        let connection = self
            .accounts
            .get_connection(user_id)
            .await?
            .ok_or(EngineError::NotConnected)?;

        let expires_soon = connection.token_expires_at.is_some_and(|expires_at| {
            expires_at - Utc::now() <= Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS)
        });

        if !expires_soon {
            let access_token = self
                .secrets
                .decrypt(&connection.access_token_enc)
                .context("stored access token could not be decrypted")?;
            return Ok(AccessGrant {
                access_token,
                x_user_id: connection.x_user_id,
            });
        }

        self.refresh(user_id, &connection).await
    }
}
