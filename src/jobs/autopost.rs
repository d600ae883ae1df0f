//! Auto-post processor.
//!
//! Publishing is user-visible and irreversible, so unlike discovery and
//! engagement this processor takes a per-user distributed lock before doing
//! anything. The run then gates on config, time window, and frequency,
//! generates up to three segments, dedups them against a bounded window of
//! recent posts, and publishes them as an optional thread. The run marker is
//! advanced after every attempted run whether or not anything was posted, and
//! the lock is released on every exit path that acquired it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants::{
    AUTOPOST_LOCK_TTL_SECS, JITTER_POST_MAX_MS, JITTER_POST_MIN_MS, POST_MAX_CHARS,
    RECENT_POST_DEDUP_WINDOW, THREAD_MAX_PARTS,
};
use crate::errors::{is_cap_exceeded, is_non_retryable};
use crate::ai::PostPrompt;
use crate::jobs::context::Services;
use crate::storage::cache::keys;
use crate::storage::records::{LogContext, LogStatus, NewGeneratedPost, UsageAction, UsageMeta};
use crate::text::{collapse_whitespace, fingerprint_text, truncate_chars};

pub mod reason {
    pub const ALREADY_RUNNING: &str = "already_running";
    pub const NOT_READY: &str = "not_ready";
    pub const DISABLED: &str = "disabled";
    pub const OUTSIDE_WINDOW: &str = "outside_window";
    pub const NOT_DUE: &str = "not_due";
    pub const EMPTY_GENERATION: &str = "empty_generation";
    pub const TOKEN_UNAVAILABLE: &str = "x_access_token_unavailable";
    pub const ALL_BLOCKED: &str = "all_blocked";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoPostOptions {
    /// Bypass the enabled/window/frequency gates (manual trigger).
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoPostOutcome {
    pub posted: u32,
    pub skipped: u32,
    pub blocked: u32,
    /// Machine-readable reason when nothing was posted.
    pub reason: Option<String>,
}

impl AutoPostOutcome {
    fn skipped(reason: &str) -> Self {
        Self {
            skipped: 1,
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

fn to_minutes(value: &str) -> u32 {
    let mut parts = value.splitn(2, ':');
    let hours: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minutes: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    hours * 60 + minutes
}

/// Whether `now_minutes` (minutes past local midnight) falls within the
/// posting window. Windows may wrap past midnight; a zero-length window is
/// treated as always open.
pub fn is_within_window(window_start: &str, window_end: &str, now_minutes: u32) -> bool {
    let start = to_minutes(window_start);
    let end = to_minutes(window_end);

    if start == end {
        return true;
    }
    if start <= end {
        now_minutes >= start && now_minutes <= end
    } else {
        now_minutes >= start || now_minutes <= end
    }
}

/// Whether enough time has elapsed since the previous run. A user who never
/// ran is always due.
pub fn is_due(last_run_at: Option<DateTime<Utc>>, frequency_minutes: i64, now: DateTime<Utc>) -> bool {
    match last_run_at {
        None => true,
        Some(last) => now - last >= chrono::Duration::minutes(frequency_minutes),
    }
}

fn minutes_past_midnight(now: DateTime<Utc>) -> u32 {
    use chrono::Timelike;
    now.hour() * 60 + now.minute()
}

enum LockState {
    Held { key: String, holder: String },
    /// Lock backend unavailable; run without exclusion and skip release.
    Fallback,
}

pub async fn run_auto_post(
    services: &Services,
    user_id: &str,
    options: AutoPostOptions,
) -> Result<AutoPostOutcome> {
    let key = keys::autopost_lock_key(user_id);
    let holder = uuid::Uuid::new_v4().to_string();
    let lock = match services
        .coordination
        .acquire_lock(&key, &holder, Duration::from_secs(AUTOPOST_LOCK_TTL_SECS))
        .await
    {
        Ok(true) => LockState::Held { key, holder },
        Ok(false) => {
            debug!(user_id = %user_id, "Auto-post already running for user");
            return Ok(AutoPostOutcome::skipped(reason::ALREADY_RUNNING));
        }
        Err(err) => {
            warn!(
                user_id = %user_id,
                error = %err,
                "Lock backend unavailable, running auto-post without exclusion"
            );
            LockState::Fallback
        }
    };

    let result = run_gated(services, user_id, options).await;

    if let LockState::Held { key, holder } = lock {
        if let Err(err) = services.coordination.release_lock(&key, &holder).await {
            warn!(user_id = %user_id, error = %err, "Failed to release auto-post lock");
        }
    }

    result
}

async fn run_gated(
    services: &Services,
    user_id: &str,
    options: AutoPostOptions,
) -> Result<AutoPostOutcome> {
    let connection = services.accounts.get_connection(user_id).await?;
    let config = services.configs.auto_post_config(user_id).await?;
    let (Some(_), Some(config)) = (connection, config) else {
        return Ok(AutoPostOutcome::skipped(reason::NOT_READY));
    };

    if !options.force {
        if !config.enabled {
            return Ok(AutoPostOutcome::skipped(reason::DISABLED));
        }
        let now = (services.clock)();
        if !is_within_window(
            &config.window_start,
            &config.window_end,
            minutes_past_midnight(now),
        ) {
            return Ok(AutoPostOutcome::skipped(reason::OUTSIDE_WINDOW));
        }
        if !is_due(config.last_run_at, config.frequency_minutes, now) {
            return Ok(AutoPostOutcome::skipped(reason::NOT_DUE));
        }
    }

    let token_manager = services.token_manager();
    let grant = match token_manager.get_valid_access_token(user_id).await {
        Ok(grant) => grant,
        Err(err) if is_non_retryable(&err) => {
            // Advance the run marker so a broken connection does not hot-loop
            // on every trigger.
            services.configs.set_last_run_at(user_id, Utc::now()).await?;
            services
                .log_action(
                    user_id,
                    "autopost_blocked",
                    LogStatus::Blocked,
                    Some(err.to_string()),
                    LogContext::AutoPost {
                        posted_ids: vec![],
                        blocked: 1,
                        reason: Some(reason::TOKEN_UNAVAILABLE.to_string()),
                    },
                )
                .await;
            return Ok(AutoPostOutcome {
                blocked: 1,
                reason: Some(reason::TOKEN_UNAVAILABLE.to_string()),
                ..AutoPostOutcome::default()
            });
        }
        Err(err) => return Err(err),
    };

    let recent_texts = services
        .posts
        .recent_texts(user_id, RECENT_POST_DEDUP_WINDOW)
        .await?;
    let mut recent_fingerprints: HashSet<String> =
        recent_texts.iter().map(|text| fingerprint_text(text)).collect();

    let generated = services
        .generator
        .generate_post(&PostPrompt {
            topics: config.topics.clone(),
            thread_mode: config.thread_mode,
            language: config.language.clone(),
            recent_posts: recent_texts,
        })
        .await?;

    let parts = prepare_segments(&generated, config.thread_mode);
    if parts.is_empty() {
        services.configs.set_last_run_at(user_id, Utc::now()).await?;
        services
            .log_action(
                user_id,
                "autopost",
                LogStatus::Info,
                Some("Auto-post skipped: generation produced no usable segments".to_string()),
                LogContext::AutoPost {
                    posted_ids: vec![],
                    blocked: 0,
                    reason: Some(reason::EMPTY_GENERATION.to_string()),
                },
            )
            .await;
        return Ok(AutoPostOutcome::skipped(reason::EMPTY_GENERATION));
    }

    let ledger = services.ledger();
    let mut outcome = AutoPostOutcome::default();
    let mut posted_ids: Vec<String> = Vec::new();
    let mut thread_parent: Option<String> = None;

    for part in &parts {
        let fingerprint = fingerprint_text(part);
        if recent_fingerprints.contains(&fingerprint) {
            outcome.blocked += 1;
            continue;
        }

        let moderation = services.generator.moderate(part).await?;
        if !moderation.allowed {
            outcome.blocked += 1;
            services
                .log_action(
                    user_id,
                    "autopost_blocked",
                    LogStatus::Blocked,
                    moderation.reason,
                    LogContext::None,
                )
                .await;
            continue;
        }

        if let Err(err) = ledger.assert_within_hard_cap(user_id, UsageAction::Tweet).await {
            if is_cap_exceeded(&err) {
                // A cap hit ends the whole run, not just this segment.
                outcome.blocked += 1;
                services
                    .log_action(
                        user_id,
                        "autopost_blocked",
                        LogStatus::Blocked,
                        Some(err.to_string()),
                        LogContext::None,
                    )
                    .await;
                break;
            }
            return Err(err);
        }

        services
            .pacing
            .pause(JITTER_POST_MIN_MS, JITTER_POST_MAX_MS)
            .await;
        let published = match services
            .x_api
            .publish_post(&grant.access_token, part, thread_parent.as_deref())
            .await
        {
            Ok(published) => published,
            Err(err) if err.is_non_retryable() => {
                outcome.blocked += 1;
                services
                    .log_action(
                        user_id,
                        "autopost_blocked",
                        LogStatus::Blocked,
                        Some(err.to_string()),
                        LogContext::None,
                    )
                    .await;
                break;
            }
            // Retryable publish failures propagate; completed segments are
            // not rolled back and the recent-window dedup absorbs the re-run.
            Err(err) => return Err(err.into()),
        };

        services
            .posts
            .insert_post(&NewGeneratedPost {
                user_id: user_id.to_string(),
                text: part.clone(),
                thread_parts: parts.clone(),
                x_post_id: published.id.clone(),
                source_topic: config.topics.first().cloned(),
            })
            .await?;
        ledger
            .record_usage_event(
                user_id,
                UsageAction::Tweet,
                UsageMeta::Tweet {
                    post_id: published.id.clone(),
                    fingerprint: fingerprint.clone(),
                },
            )
            .await?;

        recent_fingerprints.insert(fingerprint);
        if config.thread_mode {
            thread_parent = Some(published.id.clone());
        }
        posted_ids.push(published.id);
        outcome.posted += 1;
    }

    services.configs.set_last_run_at(user_id, Utc::now()).await?;

    let (status, message) = if outcome.posted > 0 {
        (
            LogStatus::Success,
            format!("Auto-post completed. Published posts: {}", outcome.posted),
        )
    } else if outcome.blocked > 0 {
        outcome.reason = Some(reason::ALL_BLOCKED.to_string());
        (
            LogStatus::Blocked,
            "Auto-post completed without publishing: every segment was blocked".to_string(),
        )
    } else {
        (
            LogStatus::Info,
            "Auto-post completed without publishing".to_string(),
        )
    };

    info!(
        user_id = %user_id,
        posted = outcome.posted,
        blocked = outcome.blocked,
        "Auto-post run complete"
    );
    services
        .log_action(
            user_id,
            "autopost",
            status,
            Some(message),
            LogContext::AutoPost {
                posted_ids,
                blocked: outcome.blocked,
                reason: outcome.reason.clone(),
            },
        )
        .await;

    Ok(outcome)
}

/// Normalize generated segments and drop in-batch duplicates, capping the
/// final count at one post or three thread parts.
fn prepare_segments(generated: &[String], thread_mode: bool) -> Vec<String> {
    let limit = if thread_mode { THREAD_MAX_PARTS } else { 1 };
    let mut seen = HashSet::new();
    let mut parts = Vec::new();

    for raw in generated {
        let normalized = truncate_chars(collapse_whitespace(raw).trim(), POST_MAX_CHARS);
        if normalized.is_empty() {
            continue;
        }
        let fingerprint = fingerprint_text(&normalized);
        if !seen.insert(fingerprint) {
            continue;
        }
        parts.push(normalized);
        if parts.len() == limit {
            break;
        }
    }

    parts
}

/// Convenience wrapper mirroring the scheduler-triggered path.
pub async fn run_auto_post_for_user(services: &Services, user_id: &str) -> Result<AutoPostOutcome> {
    run_auto_post(services, user_id, AutoPostOptions::default()).await
}
