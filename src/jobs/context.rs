//! Service bundle handed to every processor invocation.
//!
//! Constructed once at process start and passed by reference; no processor
//! reaches for ambient globals. Tests assemble the same bundle from in-memory
//! implementations.

use std::sync::Arc;

use crate::ai::TextGenerator;
use crate::coordination::CoordinationCache;
use crate::limits::{Clock, UsageLedger};
use crate::secrets::SecretsCodec;
use crate::storage::records::{ActionLogEntry, LogContext, LogStatus};
use crate::storage::{
    AccountStorage, AuditStorage, CandidateStorage, ConfigStorage, GeneratedPostStorage,
    TopicStorage, UsageStorage,
};
use crate::text::random_jitter_ms;
use crate::x::client::XApi;
use crate::x::connection::TokenManager;
use crate::x::oauth::AppOAuthCredentials;

/// Whether intentional anti-burst delays are applied. Tests disable pacing to
/// stay fast and deterministic.
#[derive(Debug, Clone, Copy)]
pub struct PacingPolicy {
    enabled: bool,
}

impl PacingPolicy {
    pub fn enabled() -> Self {
        Self { enabled: true }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    /// Sleep a uniformly random duration within the bounds.
    pub async fn pause(&self, min_ms: u64, max_ms: u64) {
        if !self.enabled {
            return;
        }
        let delay = random_jitter_ms(min_ms, max_ms);
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }
}

#[derive(Clone)]
pub struct Services {
    pub accounts: Arc<dyn AccountStorage>,
    pub topics: Arc<dyn TopicStorage>,
    pub candidates: Arc<dyn CandidateStorage>,
    pub configs: Arc<dyn ConfigStorage>,
    pub posts: Arc<dyn GeneratedPostStorage>,
    pub usage: Arc<dyn UsageStorage>,
    pub audit: Arc<dyn AuditStorage>,
    pub coordination: Arc<dyn CoordinationCache>,
    pub secrets: Arc<dyn SecretsCodec>,
    pub generator: Arc<dyn TextGenerator>,
    pub x_api: Arc<dyn XApi>,
    pub default_credentials: Option<AppOAuthCredentials>,
    pub pacing: PacingPolicy,
    pub clock: Clock,
}

impl Services {
    pub fn ledger(&self) -> UsageLedger {
        UsageLedger::with_clock(
            self.accounts.clone(),
            self.topics.clone(),
            self.usage.clone(),
            self.clock.clone(),
        )
    }

    pub fn token_manager(&self) -> TokenManager {
        TokenManager::new(
            self.accounts.clone(),
            self.secrets.clone(),
            self.x_api.clone(),
            self.default_credentials.clone(),
        )
    }

    /// Write one audit entry. Audit failures are logged and swallowed: the
    /// log is a write-only sink and must not fail a run that already
    /// performed its side effects.
    pub async fn log_action(
        &self,
        user_id: &str,
        action: &str,
        status: LogStatus,
        message: Option<String>,
        context: LogContext,
    ) {
        let entry = ActionLogEntry {
            user_id: user_id.to_string(),
            action: action.to_string(),
            status,
            message,
            context,
        };
        if let Err(err) = self.audit.log(&entry).await {
            tracing::warn!(
                user_id = %user_id,
                action = %action,
                error = %err,
                "Failed to write action log entry"
            );
        }
    }
}
