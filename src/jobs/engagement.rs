//! Engagement processor: reply to pending candidates, then best-effort like
//! and follow.
//!
//! Cap exhaustion on the reply check ends the whole run; any other failure in
//! a candidate's pipeline is logged and the run moves on to the next
//! candidate. Likes and follows are strictly best-effort and never fail the
//! candidate that triggered them.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{
    ENGAGEMENT_BATCH_SIZE, JITTER_POST_MAX_MS, JITTER_POST_MIN_MS, JITTER_SECONDARY_MAX_MS,
    JITTER_SECONDARY_MIN_MS, RECENT_REPLY_HINTS,
};
use crate::errors::{EngineError, is_cap_exceeded, is_non_retryable};
use crate::ai::ReplyPrompt;
use crate::jobs::context::Services;
use crate::limits::UsageLedger;
use crate::storage::records::{
    Candidate, LogContext, LogStatus, ModerationStatus, ReplyConfig, UsageAction, UsageMeta,
};
use crate::text::fingerprint_text;
use crate::x::connection::AccessGrant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementOutcome {
    pub replied: u32,
    pub liked: u32,
    pub followed: u32,
    pub blocked: u32,
}

/// What happened to one candidate.
enum CandidateResult {
    Replied { liked: bool, followed: bool },
    Blocked,
}

pub async fn run_engagement(services: &Services, user_id: &str) -> Result<EngagementOutcome> {
    let mut outcome = EngagementOutcome::default();

    if services.accounts.get_connection(user_id).await?.is_none() {
        debug!(user_id = %user_id, "Engagement skipped: user has no X connection");
        return Ok(outcome);
    }

    let config = services
        .configs
        .reply_config(user_id)
        .await?
        .unwrap_or_else(|| ReplyConfig::default_for(user_id));

    let token_manager = services.token_manager();
    let grant = match token_manager.get_valid_access_token(user_id).await {
        Ok(grant) => grant,
        Err(err) if is_non_retryable(&err) => {
            outcome.blocked += 1;
            services
                .log_action(
                    user_id,
                    "engagement_blocked",
                    LogStatus::Blocked,
                    Some(err.to_string()),
                    LogContext::None,
                )
                .await;
            return Ok(outcome);
        }
        Err(err) => return Err(err),
    };

    let candidates = services
        .candidates
        .pending_candidates(user_id, ENGAGEMENT_BATCH_SIZE)
        .await?;
    let recent_replies = services
        .candidates
        .recent_reply_texts(user_id, RECENT_REPLY_HINTS)
        .await?;
    let ledger = services.ledger();

    for candidate in &candidates {
        match engage_candidate(
            services,
            &ledger,
            user_id,
            &grant,
            &config,
            candidate,
            &recent_replies,
        )
        .await
        {
            Ok(CandidateResult::Replied { liked, followed }) => {
                outcome.replied += 1;
                if liked {
                    outcome.liked += 1;
                }
                if followed {
                    outcome.followed += 1;
                }
            }
            Ok(CandidateResult::Blocked) => outcome.blocked += 1,
            Err(err) if is_cap_exceeded(&err) => {
                // Cap exhaustion is terminal for this run; the next scheduled
                // run picks up where the window allows.
                info!(user_id = %user_id, error = %err, "Reply cap reached, ending engagement run");
                services
                    .log_action(
                        user_id,
                        "engagement_cap",
                        LogStatus::Blocked,
                        Some(err.to_string()),
                        LogContext::Candidate {
                            post_id: candidate.post_id.clone(),
                        },
                    )
                    .await;
                break;
            }
            Err(err) => {
                warn!(
                    user_id = %user_id,
                    post_id = %candidate.post_id,
                    error = %err,
                    "Candidate engagement failed"
                );
                services
                    .log_action(
                        user_id,
                        "engagement_error",
                        LogStatus::Error,
                        Some(err.to_string()),
                        LogContext::Candidate {
                            post_id: candidate.post_id.clone(),
                        },
                    )
                    .await;
            }
        }
    }

    services
        .log_action(
            user_id,
            "engagement",
            LogStatus::Success,
            Some(format!(
                "Engagement completed: replies={}, likes={}, follows={}, blocked={}",
                outcome.replied, outcome.liked, outcome.followed, outcome.blocked
            )),
            LogContext::Engagement {
                replied: outcome.replied,
                liked: outcome.liked,
                followed: outcome.followed,
                blocked: outcome.blocked,
            },
        )
        .await;

    Ok(outcome)
}

async fn engage_candidate(
    services: &Services,
    ledger: &UsageLedger,
    user_id: &str,
    grant: &AccessGrant,
    config: &ReplyConfig,
    candidate: &Candidate,
    recent_replies: &[String],
) -> Result<CandidateResult> {
    // The cap check failure propagates so the caller can end the run.
    ledger
        .assert_within_hard_cap(user_id, UsageAction::Reply)
        .await?;

    let reply = services
        .generator
        .generate_reply(&ReplyPrompt {
            post_text: candidate.text.clone(),
            tone: config.tone,
            cta_style: config.cta_style,
            bio_context: config.bio_context.clone(),
            recent_replies: recent_replies.to_vec(),
        })
        .await?;
    let fingerprint = fingerprint_text(&reply);

    if services.candidates.reply_text_exists(user_id, &reply).await? {
        services
            .candidates
            .set_moderation_status(&candidate.id, ModerationStatus::Blocked)
            .await?;
        debug!(
            user_id = %user_id,
            post_id = %candidate.post_id,
            "{}",
            EngineError::DuplicateContent
        );
        return Ok(CandidateResult::Blocked);
    }

    let moderation = services.generator.moderate(&reply).await?;
    if !moderation.allowed {
        let reason = moderation
            .reason
            .unwrap_or_else(|| "moderation rejected".to_string());
        services
            .candidates
            .set_moderation_status(&candidate.id, ModerationStatus::Blocked)
            .await?;
        services
            .log_action(
                user_id,
                "reply_blocked",
                LogStatus::Blocked,
                Some(
                    EngineError::ModerationRejected {
                        reason: reason.clone(),
                    }
                    .to_string(),
                ),
                LogContext::Candidate {
                    post_id: candidate.post_id.clone(),
                },
            )
            .await;
        return Ok(CandidateResult::Blocked);
    }

    services
        .pacing
        .pause(JITTER_POST_MIN_MS, JITTER_POST_MAX_MS)
        .await;
    services
        .x_api
        .publish_post(&grant.access_token, &reply, Some(&candidate.post_id))
        .await?;

    services
        .candidates
        .mark_replied(&candidate.id, &reply, &fingerprint, Utc::now())
        .await?;
    ledger
        .record_usage_event(
            user_id,
            UsageAction::Reply,
            UsageMeta::Reply {
                post_id: candidate.post_id.clone(),
            },
        )
        .await?;

    let liked = if config.like_on_reply && candidate.liked_at.is_none() {
        like_candidate(services, ledger, user_id, grant, candidate).await
    } else {
        false
    };

    let followed = if config.follow_on_reply && candidate.followed_at.is_none() {
        follow_author(services, ledger, user_id, grant, candidate).await
    } else {
        false
    };

    Ok(CandidateResult::Replied { liked, followed })
}

/// Best-effort like: failures are logged as skipped, never propagated.
async fn like_candidate(
    services: &Services,
    ledger: &UsageLedger,
    user_id: &str,
    grant: &AccessGrant,
    candidate: &Candidate,
) -> bool {
    let attempt = async {
        ledger
            .assert_within_hard_cap(user_id, UsageAction::Like)
            .await?;
        services
            .pacing
            .pause(JITTER_SECONDARY_MIN_MS, JITTER_SECONDARY_MAX_MS)
            .await;
        services
            .x_api
            .like_post(&grant.access_token, &grant.x_user_id, &candidate.post_id)
            .await?;
        services.candidates.mark_liked(&candidate.id, Utc::now()).await?;
        ledger
            .record_usage_event(
                user_id,
                UsageAction::Like,
                UsageMeta::Like {
                    post_id: candidate.post_id.clone(),
                },
            )
            .await?;
        Ok::<(), anyhow::Error>(())
    };

    match attempt.await {
        Ok(()) => true,
        Err(err) => {
            services
                .log_action(
                    user_id,
                    "like_skip",
                    LogStatus::Blocked,
                    Some(err.to_string()),
                    LogContext::Candidate {
                        post_id: candidate.post_id.clone(),
                    },
                )
                .await;
            false
        }
    }
}

/// Best-effort follow, additionally gated by the plan's follow allowance via
/// the cap check.
async fn follow_author(
    services: &Services,
    ledger: &UsageLedger,
    user_id: &str,
    grant: &AccessGrant,
    candidate: &Candidate,
) -> bool {
    let attempt = async {
        ledger
            .assert_within_hard_cap(user_id, UsageAction::Follow)
            .await?;
        services
            .pacing
            .pause(JITTER_SECONDARY_MIN_MS, JITTER_SECONDARY_MAX_MS)
            .await;
        services
            .x_api
            .follow_user(&grant.access_token, &grant.x_user_id, &candidate.author_id)
            .await?;
        services
            .candidates
            .mark_followed(&candidate.id, Utc::now())
            .await?;
        ledger
            .record_usage_event(
                user_id,
                UsageAction::Follow,
                UsageMeta::Follow {
                    author_id: candidate.author_id.clone(),
                },
            )
            .await?;
        Ok::<(), anyhow::Error>(())
    };

    match attempt.await {
        Ok(()) => true,
        Err(err) => {
            services
                .log_action(
                    user_id,
                    "follow_skip",
                    LogStatus::Blocked,
                    Some(err.to_string()),
                    LogContext::Author {
                        author_id: candidate.author_id.clone(),
                    },
                )
                .await;
            false
        }
    }
}
