//! Configuration management for the xgrowth engine.
//!
//! Loaded from environment variables at process start. Validating newtypes
//! catch malformed values before any pool or client is constructed.

use crate::errors::ConfigError;
use crate::x::oauth::{AppOAuthCredentials, is_likely_client_id, normalize_client_id};

type Result<T> = std::result::Result<T, ConfigError>;

fn required(var_name: &str) -> Result<String> {
    std::env::var(var_name).map_err(|_| ConfigError::EnvVarRequired {
        var_name: var_name.to_string(),
    })
}

fn optional(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().filter(|v| !v.is_empty())
}

fn optional_url(var_name: &str) -> Result<Option<String>> {
    match optional(var_name) {
        None => Ok(None),
        Some(value) => {
            url::Url::parse(&value).map_err(|e| ConfigError::InvalidUrl {
                var_name: var_name.to_string(),
                details: e.to_string(),
            })?;
            Ok(Some(value))
        }
    }
}

fn url_with_default(var_name: &str, default: &str) -> Result<String> {
    let value = optional(var_name).unwrap_or_else(|| default.to_string());
    url::Url::parse(&value).map_err(|e| ConfigError::InvalidUrl {
        var_name: var_name.to_string(),
        details: e.to_string(),
    })?;
    Ok(value)
}

/// Key material for the secrets codec. Must be non-empty; the codec itself
/// accepts either a base64 32-byte key or a passphrase.
#[derive(Clone)]
pub struct TokenEncryptionKey(String);

impl TryFrom<String> for TokenEncryptionKey {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                var_name: "TOKEN_ENCRYPTION_KEY".to_string(),
                value: "<empty>".to_string(),
            });
        }
        Ok(Self(value))
    }
}

impl AsRef<str> for TokenEncryptionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Scheduler tick interval in seconds; zero is rejected.
#[derive(Clone, Copy, Debug)]
pub struct TickIntervalSecs(u64);

impl Default for TickIntervalSecs {
    fn default() -> Self {
        Self(60)
    }
}

impl TryFrom<String> for TickIntervalSecs {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        let secs = value
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidValue {
                var_name: "SCHEDULER_TICK_SECS".to_string(),
                value: value.clone(),
            })?;
        if secs == 0 {
            return Err(ConfigError::InvalidValue {
                var_name: "SCHEDULER_TICK_SECS".to_string(),
                value,
            });
        }
        Ok(Self(secs))
    }
}

impl TickIntervalSecs {
    pub fn as_secs(&self) -> u64 {
        self.0
    }
}

/// Endpoints and process-wide OAuth app configuration for the X API.
#[derive(Clone)]
pub struct XApiConfig {
    pub api_base_url: String,
    pub oauth_token_url: String,
    pub oauth_authorize_url: String,
    pub scopes: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub callback_url: Option<String>,
}

impl XApiConfig {
    /// Process-wide default app credentials, when configured with a
    /// plausible client id.
    pub fn default_credentials(&self) -> Option<AppOAuthCredentials> {
        let client_id = normalize_client_id(self.client_id.as_deref()?);
        if !is_likely_client_id(&client_id) {
            return None;
        }
        Some(AppOAuthCredentials {
            client_id,
            client_secret: self.client_secret.clone(),
            callback_url: self.callback_url.clone(),
        })
    }
}

#[derive(Clone)]
pub struct AiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub token_encryption_key: TokenEncryptionKey,
    pub x: XApiConfig,
    pub ai: AiConfig,
    pub scheduler_tick: TickIntervalSecs,
}

impl Config {
    pub fn new() -> Result<Self> {
        let database_url = required("DATABASE_URL")?;
        let redis_url = optional("REDIS_URL");
        let token_encryption_key = TokenEncryptionKey::try_from(required("TOKEN_ENCRYPTION_KEY")?)?;

        let x = XApiConfig {
            api_base_url: url_with_default("X_API_BASE_URL", "https://api.x.com/2")?,
            oauth_token_url: url_with_default("X_OAUTH_TOKEN_URL", "https://api.x.com/2/oauth2/token")?,
            oauth_authorize_url: url_with_default(
                "X_OAUTH_AUTHORIZE_URL",
                "https://x.com/i/oauth2/authorize",
            )?,
            scopes: optional("X_SCOPES").unwrap_or_else(|| {
                "tweet.read tweet.write users.read like.write follows.write offline.access"
                    .to_string()
            }),
            client_id: optional("X_CLIENT_ID"),
            client_secret: optional("X_CLIENT_SECRET"),
            callback_url: optional_url("X_CALLBACK_URL")?,
        };

        let ai = AiConfig {
            api_key: optional("OPENAI_API_KEY"),
            base_url: url_with_default("OPENAI_BASE_URL", "https://api.openai.com/v1")?,
            model: optional("OPENAI_MODEL").unwrap_or_else(|| "gpt-4.1-mini".to_string()),
        };

        let scheduler_tick = match optional("SCHEDULER_TICK_SECS") {
            Some(value) => TickIntervalSecs::try_from(value)?,
            None => TickIntervalSecs::default(),
        };

        Ok(Self {
            database_url,
            redis_url,
            token_encryption_key,
            x,
            ai,
            scheduler_tick,
        })
    }
}
