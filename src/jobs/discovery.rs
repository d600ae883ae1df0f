//! Discovery processor: one search per active topic, dedup against the
//! short-term seen set and the persisted candidate table, then candidate
//! persistence.
//!
//! Re-running with unchanged upstream results produces zero new candidates;
//! concurrent runs for the same user are absorbed by the (user, post) unique
//! constraint rather than a lock.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants::SEEN_POST_TTL_SECS;
use crate::errors::is_non_retryable;
use crate::jobs::context::Services;
use crate::storage::cache::keys;
use crate::storage::records::{LogContext, LogStatus, NewCandidate, UsageAction, UsageMeta};
use crate::text::{contains_excluded_words, fingerprint_text};
use crate::x::types::SearchQuery;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryOutcome {
    pub discovered: u32,
    pub skipped: u32,
    pub blocked: u32,
}

pub async fn run_discovery(services: &Services, user_id: &str) -> Result<DiscoveryOutcome> {
    let mut outcome = DiscoveryOutcome::default();

    if services.accounts.get_connection(user_id).await?.is_none() {
        debug!(user_id = %user_id, "Discovery skipped: user has no X connection");
        return Ok(outcome);
    }

    let token_manager = services.token_manager();
    let grant = match token_manager.get_valid_access_token(user_id).await {
        Ok(grant) => grant,
        Err(err) if is_non_retryable(&err) => {
            outcome.blocked += 1;
            services
                .log_action(
                    user_id,
                    "discovery_blocked",
                    LogStatus::Blocked,
                    Some(err.to_string()),
                    LogContext::None,
                )
                .await;
            return Ok(outcome);
        }
        Err(err) => return Err(err),
    };

    let ledger = services.ledger();
    let topics = services.topics.active_topics(user_id).await?;

    'topics: for topic in &topics {
        let query = SearchQuery {
            keyword: topic.keyword.clone(),
            language: topic.language.clone(),
            min_likes: topic.min_likes,
        };

        let posts = match services.x_api.search_recent(&grant.access_token, &query).await {
            Ok(posts) => posts,
            Err(err) if err.is_non_retryable() => {
                warn!(
                    user_id = %user_id,
                    keyword = %topic.keyword,
                    error = %err,
                    "Search blocked, stopping discovery run"
                );
                outcome.blocked += 1;
                services
                    .log_action(
                        user_id,
                        "discovery_blocked",
                        LogStatus::Blocked,
                        Some(err.to_string()),
                        LogContext::None,
                    )
                    .await;
                break 'topics;
            }
            Err(err) => return Err(err.into()),
        };

        for post in posts {
            let seen_key = keys::seen_post_key(user_id, &post.id);
            if services.coordination.was_seen(&seen_key).await.unwrap_or(false) {
                outcome.skipped += 1;
                continue;
            }
            if services
                .candidates
                .find_by_post_id(user_id, &post.id)
                .await?
                .is_some()
            {
                outcome.skipped += 1;
                continue;
            }
            if contains_excluded_words(&post.text, &topic.exclude_words) {
                outcome.skipped += 1;
                continue;
            }

            let inserted = services
                .candidates
                .insert_candidate(&NewCandidate {
                    user_id: user_id.to_string(),
                    post_id: post.id.clone(),
                    author_id: post.author_id,
                    author_handle: post.author_handle,
                    text: post.text.clone(),
                    language: post.language,
                    like_count: post.like_count,
                    duplicate_fingerprint: fingerprint_text(&post.text),
                })
                .await?;

            if inserted {
                outcome.discovered += 1;
            } else {
                // A concurrent run persisted the same post first.
                outcome.skipped += 1;
            }

            if let Err(err) = services
                .coordination
                .mark_seen(&seen_key, Duration::from_secs(SEEN_POST_TTL_SECS))
                .await
            {
                warn!(user_id = %user_id, error = %err, "Failed to mark post as seen");
            }
        }

        ledger
            .record_usage_event(
                user_id,
                UsageAction::Discovery,
                UsageMeta::Discovery {
                    topic_id: topic.id.clone(),
                    keyword: topic.keyword.clone(),
                },
            )
            .await?;
    }

    info!(
        user_id = %user_id,
        discovered = outcome.discovered,
        skipped = outcome.skipped,
        blocked = outcome.blocked,
        "Discovery run complete"
    );
    services
        .log_action(
            user_id,
            "discovery",
            LogStatus::Success,
            Some(format!(
                "Discovery completed. New candidates: {}, skipped: {}",
                outcome.discovered, outcome.skipped
            )),
            LogContext::Discovery {
                discovered: outcome.discovered,
                skipped: outcome.skipped,
                blocked: outcome.blocked,
            },
        )
        .await;

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;
    use crate::storage::records::Topic;
    use crate::test_helpers::{TestHarness, search_post};
    use chrono::Utc;

    fn topic(id: &str, keyword: &str, exclude: &[&str]) -> Topic {
        Topic {
            id: id.to_string(),
            user_id: "u1".to_string(),
            keyword: keyword.to_string(),
            language: Some("en".to_string()),
            min_likes: 0,
            exclude_words: exclude.iter().map(|s| s.to_string()).collect(),
            active: true,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn no_connection_is_a_noop() {
        let harness = TestHarness::new().await;
        let outcome = run_discovery(&harness.services, "stranger").await.unwrap();
        assert_eq!(outcome, DiscoveryOutcome::default());
        assert!(harness.api.search_calls() == 0);
    }

    #[tokio::test]
    async fn discovered_posts_are_persisted_and_marked_seen() {
        let harness = TestHarness::new().await;
        harness.connect_user("u1").await;
        harness.services.topics.upsert_topic(&topic("t1", "rust", &[])).await.unwrap();
        harness.api.set_search_results(vec![
            search_post("p1", "rust async patterns", 5),
            search_post("p2", "tokio runtime deep dive", 9),
        ]);

        let outcome = run_discovery(&harness.services, "u1").await.unwrap();
        assert_eq!(outcome.discovered, 2);
        assert_eq!(outcome.skipped, 0);

        assert!(
            harness
                .services
                .candidates
                .find_by_post_id("u1", "p1")
                .await
                .unwrap()
                .is_some()
        );

        // One DISCOVERY usage event per topic.
        assert_eq!(harness.usage.all_events().await.len(), 1);

        let logs = harness.audit.entries_for_action("discovery").await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].entry.status, LogStatus::Success);
    }

    #[tokio::test]
    async fn rerun_with_identical_upstream_is_idempotent() {
        let harness = TestHarness::new().await;
        harness.connect_user("u1").await;
        harness.services.topics.upsert_topic(&topic("t1", "rust", &[])).await.unwrap();
        harness.api.set_search_results(vec![
            search_post("p1", "rust async patterns", 5),
            search_post("p2", "tokio runtime deep dive", 9),
        ]);

        let first = run_discovery(&harness.services, "u1").await.unwrap();
        assert_eq!(first.discovered, 2);

        let second = run_discovery(&harness.services, "u1").await.unwrap();
        assert_eq!(second.discovered, 0);
        assert_eq!(second.skipped, 2);
    }

    #[tokio::test]
    async fn excluded_words_filter_candidates() {
        let harness = TestHarness::new().await;
        harness.connect_user("u1").await;
        harness
            .services
            .topics
            .upsert_topic(&topic("t1", "growth", &["crypto"]))
            .await
            .unwrap();
        harness.api.set_search_results(vec![
            search_post("p1", "Organic growth tactics", 5),
            search_post("p2", "CRYPTO growth pump", 50),
        ]);

        let outcome = run_discovery(&harness.services, "u1").await.unwrap();
        assert_eq!(outcome.discovered, 1);
        assert_eq!(outcome.skipped, 1);
        assert!(
            harness
                .services
                .candidates
                .find_by_post_id("u1", "p2")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn non_retryable_search_failure_blocks_and_stops() {
        let harness = TestHarness::new().await;
        harness.connect_user("u1").await;
        // Two topics; the first search fails terminally, the second topic
        // must not be attempted.
        harness.services.topics.upsert_topic(&topic("t1", "alpha", &[])).await.unwrap();
        harness.services.topics.upsert_topic(&topic("t2", "beta", &[])).await.unwrap();
        harness.api.fail_search_with(EngineError::ThirdPartyApi {
            status: 401,
            body: "expired".to_string(),
        });

        let outcome = run_discovery(&harness.services, "u1").await.unwrap();
        assert_eq!(outcome.discovered, 0);
        assert_eq!(outcome.blocked, 1);
        assert_eq!(harness.api.search_calls(), 1);
        assert_eq!(harness.audit.entries_for_action("discovery_blocked").await.len(), 1);
    }

    #[tokio::test]
    async fn retryable_search_failure_propagates() {
        let harness = TestHarness::new().await;
        harness.connect_user("u1").await;
        harness.services.topics.upsert_topic(&topic("t1", "alpha", &[])).await.unwrap();
        harness.api.fail_search_with(EngineError::ThirdPartyApi {
            status: 503,
            body: "over capacity".to_string(),
        });

        assert!(run_discovery(&harness.services, "u1").await.is_err());
    }
}
