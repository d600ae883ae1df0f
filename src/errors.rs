use thiserror::Error;

/// Action kinds that can hit a hard cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapKind {
    Hourly,
    Replies,
    Likes,
    Tweets,
    Follows,
    Topics,
}

impl CapKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Replies => "replies",
            Self::Likes => "likes",
            Self::Tweets => "tweets",
            Self::Follows => "follows",
            Self::Topics => "topics",
        }
    }
}

impl std::fmt::Display for CapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core automation failure taxonomy.
///
/// Processors inspect this enum to decide whether a failed run should be
/// retried by the job framework or logged as blocked and abandoned until a
/// human fixes credentials, billing, or configuration.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("error-xgrowth-engine-1 User is not connected to X")]
    NotConnected,

    #[error("error-xgrowth-engine-2 Missing X app credentials for token refresh")]
    MissingAppCredentials,

    #[error("error-xgrowth-engine-3 X access token expired and no refresh token is available")]
    ReauthRequired,

    #[error("error-xgrowth-engine-4 X token refresh failed after {} attempts: {}", attempts.len(), attempts.join("; "))]
    TokenRefreshFailed { attempts: Vec<String> },

    #[error("error-xgrowth-engine-5 Hard cap reached for {kind} ({limit})")]
    CapExceeded { kind: CapKind, limit: i64 },

    #[error("error-xgrowth-engine-6 X API error {status}: {body}")]
    ThirdPartyApi { status: u16, body: String },

    #[error(
        "error-xgrowth-engine-7 Request intercepted by an upstream network policy before reaching the X API"
    )]
    NetworkBlocked,

    #[error("error-xgrowth-engine-8 Network request failed: {details}")]
    Network { details: String },

    #[error("error-xgrowth-engine-9 Content rejected by moderation: {reason}")]
    ModerationRejected { reason: String },

    #[error("error-xgrowth-engine-10 Identical content was already posted for this user")]
    DuplicateContent,
}

impl EngineError {
    /// Whether retrying the same operation can ever succeed without external
    /// remediation (re-auth, billing, credential fix).
    ///
    /// Non-retryable failures are caught by the processors, logged as a
    /// `blocked` outcome, and the current run stops without propagating, so
    /// the job framework does not spin on something that cannot succeed.
    pub fn is_non_retryable(&self) -> bool {
        match self {
            Self::NotConnected
            | Self::MissingAppCredentials
            | Self::ReauthRequired
            | Self::TokenRefreshFailed { .. }
            | Self::NetworkBlocked => true,
            Self::ThirdPartyApi { status, .. } => matches!(status, 400 | 401 | 402 | 403),
            _ => false,
        }
    }

    pub fn is_cap_exceeded(&self) -> bool {
        matches!(self, Self::CapExceeded { .. })
    }
}

/// Classify an error chain produced by a processor step.
pub fn is_non_retryable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<EngineError>()
            .is_some_and(|e| e.is_non_retryable())
    })
}

/// True when the chain bottoms out in a hard-cap failure.
pub fn is_cap_exceeded(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<EngineError>()
            .is_some_and(|e| e.is_cap_exceeded())
    })
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-xgrowth-config-1 Required environment variable not set: {var_name}")]
    EnvVarRequired { var_name: String },

    #[error("error-xgrowth-config-2 Invalid URL for {var_name}: {details}")]
    InvalidUrl { var_name: String, details: String },

    #[error("error-xgrowth-config-3 Invalid value for {var_name}: {value}")]
    InvalidValue { var_name: String, value: String },
}

#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("error-xgrowth-secrets-1 Invalid encrypted payload format")]
    InvalidPayload,

    #[error("error-xgrowth-secrets-2 Encryption failed: {details}")]
    EncryptFailed { details: String },

    #[error("error-xgrowth-secrets-3 Decryption failed: {details}")]
    DecryptFailed { details: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("error-xgrowth-storage-200 Database connection failed: {source}")]
    ConnectionFailed {
        #[source]
        source: sqlx::Error,
    },

    #[error("error-xgrowth-storage-201 Query execution failed: {source}")]
    QueryFailed {
        #[source]
        source: sqlx::Error,
    },

    #[error("error-xgrowth-storage-202 Invalid stored data: {details}")]
    InvalidInput { details: String },
}

impl From<sqlx::Error> for StorageError {
    fn from(source: sqlx::Error) -> Self {
        Self::QueryFailed { source }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("error-xgrowth-queue-1 Redis queue operation failed: {operation}: {source}")]
    RedisOperationFailed {
        operation: String,
        #[source]
        source: deadpool_redis::redis::RedisError,
    },

    #[error("error-xgrowth-queue-2 MPSC queue operation failed: {operation}: {details}")]
    MpscOperationFailed { operation: String, details: String },

    #[error("error-xgrowth-queue-3 Queue connection failed: {queue_type}: {details}")]
    ConnectionFailed { queue_type: String, details: String },

    #[error("error-xgrowth-queue-4 Queue capacity exceeded: {queue_type}: {capacity}")]
    CapacityExceeded { queue_type: String, capacity: usize },
}
