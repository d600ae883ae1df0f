//! Per-user hard-cap enforcement.
//!
//! A snapshot combines the effective limit set (both tier tables) with
//! windowed counts from the usage ledger: per-action counts since UTC
//! midnight, a rolling one-hour aggregate across side-effecting actions, and
//! the active topic count. Cap checks recompute the snapshot; check and
//! record are intentionally not atomic, because a processor performs exactly
//! one side-effecting action between a check and its usage record and the
//! windows are coarse.

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use crate::constants::{X_DAILY_FOLLOW_CEILING, X_DAILY_LIKE_CEILING};
use crate::errors::{CapKind, EngineError};
use crate::plans::{EffectiveLimits, effective_limits};
use crate::storage::records::{UsageAction, UsageMeta};
use crate::storage::{AccountStorage, TopicStorage, UsageStorage};

const HOURLY_CAP_ACTIONS: [UsageAction; 4] = [
    UsageAction::Reply,
    UsageAction::Like,
    UsageAction::Tweet,
    UsageAction::Follow,
];

/// Injected time source so window boundaries are deterministic under test.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

#[derive(Debug, Clone, Copy)]
pub struct UsageCounters {
    pub replies_today: i64,
    pub likes_today: i64,
    pub follows_today: i64,
    pub tweets_today: i64,
    pub hourly_actions: i64,
    pub topics_tracked: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct LimitSnapshot {
    pub limits: EffectiveLimits,
    pub usage: UsageCounters,
}

fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_hms_opt(0, 0, 0).expect("midnight"))
}

#[derive(Clone)]
pub struct UsageLedger {
    accounts: Arc<dyn AccountStorage>,
    topics: Arc<dyn TopicStorage>,
    usage: Arc<dyn UsageStorage>,
    clock: Clock,
}

impl UsageLedger {
    pub fn new(
        accounts: Arc<dyn AccountStorage>,
        topics: Arc<dyn TopicStorage>,
        usage: Arc<dyn UsageStorage>,
    ) -> Self {
        Self::with_clock(accounts, topics, usage, system_clock())
    }

    pub fn with_clock(
        accounts: Arc<dyn AccountStorage>,
        topics: Arc<dyn TopicStorage>,
        usage: Arc<dyn UsageStorage>,
        clock: Clock,
    ) -> Self {
        Self {
            accounts,
            topics,
            usage,
            clock,
        }
    }

    pub async fn snapshot(&self, user_id: &str) -> Result<LimitSnapshot> {
        let user = self
            .accounts
            .get_user(user_id)
            .await?
            .ok_or(EngineError::NotConnected)?;
        let connection = self
            .accounts
            .get_connection(user_id)
            .await?
            .ok_or(EngineError::NotConnected)?;

        let limits = effective_limits(user.internal_plan, connection.x_paid_tier);

        let now = (self.clock)();
        let day_start = start_of_utc_day(now);
        let hour_ago = now - Duration::hours(1);

        let replies_today = self
            .usage
            .count_since(user_id, UsageAction::Reply, day_start)
            .await?;
        let likes_today = self
            .usage
            .count_since(user_id, UsageAction::Like, day_start)
            .await?;
        let follows_today = self
            .usage
            .count_since(user_id, UsageAction::Follow, day_start)
            .await?;
        let tweets_today = self
            .usage
            .count_since(user_id, UsageAction::Tweet, day_start)
            .await?;
        let hourly_actions = self
            .usage
            .count_any_since(user_id, &HOURLY_CAP_ACTIONS, hour_ago)
            .await?;
        let topics_tracked = self.topics.count_active(user_id).await?;

        Ok(LimitSnapshot {
            limits,
            usage: UsageCounters {
                replies_today,
                likes_today,
                follows_today,
                tweets_today,
                hourly_actions,
                topics_tracked,
            },
        })
    }

    /// Fail with `CapExceeded` when performing one more `action` would pass a
    /// hard cap. The boundary is strict: a counter at `limit - 1` passes, at
    /// `limit` it fails.
    pub async fn assert_within_hard_cap(&self, user_id: &str, action: UsageAction) -> Result<()> {
        let snapshot = self.snapshot(user_id).await?;
        let limits = snapshot.limits;
        let usage = snapshot.usage;

        if usage.hourly_actions >= limits.hourly_action_cap {
            return Err(EngineError::CapExceeded {
                kind: CapKind::Hourly,
                limit: limits.hourly_action_cap,
            }
            .into());
        }

        match action {
            UsageAction::Reply => {
                if usage.replies_today >= limits.replies_per_day {
                    return Err(EngineError::CapExceeded {
                        kind: CapKind::Replies,
                        limit: limits.replies_per_day,
                    }
                    .into());
                }
            }
            UsageAction::Like => {
                let hard_cap = limits.likes_per_day.min(X_DAILY_LIKE_CEILING);
                if usage.likes_today >= hard_cap {
                    return Err(EngineError::CapExceeded {
                        kind: CapKind::Likes,
                        limit: hard_cap,
                    }
                    .into());
                }
            }
            UsageAction::Tweet => {
                if usage.tweets_today >= limits.tweets_per_day {
                    return Err(EngineError::CapExceeded {
                        kind: CapKind::Tweets,
                        limit: limits.tweets_per_day,
                    }
                    .into());
                }
            }
            UsageAction::Follow => {
                if !limits.allow_follow {
                    return Err(EngineError::CapExceeded {
                        kind: CapKind::Follows,
                        limit: 0,
                    }
                    .into());
                }
                if usage.follows_today >= X_DAILY_FOLLOW_CEILING {
                    return Err(EngineError::CapExceeded {
                        kind: CapKind::Follows,
                        limit: X_DAILY_FOLLOW_CEILING,
                    }
                    .into());
                }
            }
            UsageAction::Discovery => {}
        }

        Ok(())
    }

    pub async fn assert_topic_slots(&self, user_id: &str, additional: i64) -> Result<()> {
        let snapshot = self.snapshot(user_id).await?;
        if snapshot.usage.topics_tracked + additional > snapshot.limits.topics_tracked {
            return Err(EngineError::CapExceeded {
                kind: CapKind::Topics,
                limit: snapshot.limits.topics_tracked,
            }
            .into());
        }
        Ok(())
    }

    /// Durable bookkeeping: a failure here propagates, since under-counting
    /// would bypass caps.
    pub async fn record_usage_event(
        &self,
        user_id: &str,
        action: UsageAction,
        meta: UsageMeta,
    ) -> Result<()> {
        self.usage.record(user_id, action, meta).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::is_cap_exceeded;
    use crate::storage::records::{Connection, InternalPlan, User, XPaidTier};
    use crate::storage::{MemoryAccountStorage, MemoryTopicStorage, MemoryUsageStorage};

    /// A clock pinned to noon today keeps "earlier today but outside the last
    /// hour" well-defined regardless of when the suite runs.
    fn fixed_noon() -> DateTime<Utc> {
        start_of_utc_day(Utc::now()) + Duration::hours(12)
    }

    async fn ledger_for(
        plan: InternalPlan,
        tier: XPaidTier,
    ) -> (UsageLedger, Arc<MemoryUsageStorage>) {
        let accounts = Arc::new(MemoryAccountStorage::new());
        accounts
            .upsert_user(&User {
                id: "u1".to_string(),
                email: "demo@xgrowth.app".to_string(),
                internal_plan: plan,
            })
            .await
            .unwrap();
        accounts
            .upsert_connection(&Connection {
                user_id: "u1".to_string(),
                x_user_id: "x-1".to_string(),
                handle: None,
                access_token_enc: "enc".to_string(),
                refresh_token_enc: None,
                token_expires_at: None,
                scope: None,
                x_paid_tier: tier,
            })
            .await
            .unwrap();

        let usage = Arc::new(MemoryUsageStorage::new());
        let ledger = UsageLedger::with_clock(
            accounts,
            Arc::new(MemoryTopicStorage::new()),
            usage.clone(),
            Arc::new(fixed_noon),
        );
        (ledger, usage)
    }

    fn reply_meta(id: &str) -> UsageMeta {
        UsageMeta::Reply {
            post_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn snapshot_requires_a_connection() {
        let accounts = Arc::new(MemoryAccountStorage::new());
        let ledger = UsageLedger::new(
            accounts,
            Arc::new(MemoryTopicStorage::new()),
            Arc::new(MemoryUsageStorage::new()),
        );
        let err = ledger.snapshot("ghost").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn daily_reply_cap_boundary() {
        // FREE x PRO combines to 20 replies/day and a 12/hour aggregate cap.
        let (ledger, usage) = ledger_for(InternalPlan::Free, XPaidTier::Pro).await;
        let earlier_today = fixed_noon() - Duration::hours(2);

        for i in 0..19 {
            usage
                .record_at("u1", UsageAction::Reply, reply_meta(&i.to_string()), earlier_today)
                .await;
        }
        assert!(ledger.assert_within_hard_cap("u1", UsageAction::Reply).await.is_ok());

        usage
            .record_at("u1", UsageAction::Reply, reply_meta("19"), earlier_today)
            .await;
        let err = ledger
            .assert_within_hard_cap("u1", UsageAction::Reply)
            .await
            .unwrap_err();
        assert!(is_cap_exceeded(&err));
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::CapExceeded {
                kind: CapKind::Replies,
                limit: 20
            })
        ));
    }

    #[tokio::test]
    async fn hourly_cap_applies_before_daily_caps() {
        let (ledger, usage) = ledger_for(InternalPlan::Free, XPaidTier::Pro).await;
        let within_hour = fixed_noon() - Duration::minutes(10);
        for i in 0..12 {
            usage
                .record_at(
                    "u1",
                    UsageAction::Like,
                    UsageMeta::Like {
                        post_id: i.to_string(),
                    },
                    within_hour,
                )
                .await;
        }
        let err = ledger
            .assert_within_hard_cap("u1", UsageAction::Reply)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::CapExceeded {
                kind: CapKind::Hourly,
                limit: 12
            })
        ));
    }

    #[tokio::test]
    async fn hourly_boundary_is_strict() {
        let (ledger, usage) = ledger_for(InternalPlan::Free, XPaidTier::Pro).await;
        let within_hour = fixed_noon() - Duration::minutes(10);
        for i in 0..11 {
            usage
                .record_at(
                    "u1",
                    UsageAction::Like,
                    UsageMeta::Like {
                        post_id: i.to_string(),
                    },
                    within_hour,
                )
                .await;
        }
        // 11 of 12 passes, one more trips it.
        assert!(ledger.assert_within_hard_cap("u1", UsageAction::Reply).await.is_ok());
    }

    #[tokio::test]
    async fn follow_requires_both_plans_to_allow_it() {
        let (ledger, _) = ledger_for(InternalPlan::Free, XPaidTier::Enterprise).await;
        let err = ledger
            .assert_within_hard_cap("u1", UsageAction::Follow)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::CapExceeded {
                kind: CapKind::Follows,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn follow_platform_ceiling_applies_even_on_big_plans() {
        let (ledger, usage) = ledger_for(InternalPlan::Team, XPaidTier::Enterprise).await;
        let earlier_today = fixed_noon() - Duration::hours(2);
        for i in 0..400 {
            usage
                .record_at(
                    "u1",
                    UsageAction::Follow,
                    UsageMeta::Follow {
                        author_id: i.to_string(),
                    },
                    earlier_today,
                )
                .await;
        }
        let err = ledger
            .assert_within_hard_cap("u1", UsageAction::Follow)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::CapExceeded {
                kind: CapKind::Follows,
                limit: 400
            })
        ));
    }

    #[tokio::test]
    async fn like_ceiling_is_min_of_plan_and_platform() {
        // TEAM x ENTERPRISE allows 500 likes/day, below the 1000 platform ceiling.
        let (ledger, usage) = ledger_for(InternalPlan::Team, XPaidTier::Enterprise).await;
        let earlier_today = fixed_noon() - Duration::hours(2);
        for i in 0..500 {
            usage
                .record_at(
                    "u1",
                    UsageAction::Like,
                    UsageMeta::Like {
                        post_id: i.to_string(),
                    },
                    earlier_today,
                )
                .await;
        }
        let err = ledger
            .assert_within_hard_cap("u1", UsageAction::Like)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::CapExceeded {
                kind: CapKind::Likes,
                limit: 500
            })
        ));
    }

    #[tokio::test]
    async fn discovery_is_never_capped_by_action_limits() {
        let (ledger, usage) = ledger_for(InternalPlan::Free, XPaidTier::Free).await;
        let earlier_today = fixed_noon() - Duration::hours(2);
        for i in 0..100 {
            usage
                .record_at(
                    "u1",
                    UsageAction::Discovery,
                    UsageMeta::Discovery {
                        topic_id: i.to_string(),
                        keyword: "k".to_string(),
                    },
                    earlier_today,
                )
                .await;
        }
        assert!(
            ledger
                .assert_within_hard_cap("u1", UsageAction::Discovery)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn topic_slots_are_bounded() {
        let accounts = Arc::new(MemoryAccountStorage::new());
        accounts
            .upsert_user(&User {
                id: "u1".to_string(),
                email: "demo@xgrowth.app".to_string(),
                internal_plan: InternalPlan::Free,
            })
            .await
            .unwrap();
        accounts
            .upsert_connection(&Connection {
                user_id: "u1".to_string(),
                x_user_id: "x-1".to_string(),
                handle: None,
                access_token_enc: "enc".to_string(),
                refresh_token_enc: None,
                token_expires_at: None,
                scope: None,
                x_paid_tier: XPaidTier::Free,
            })
            .await
            .unwrap();
        let topics = Arc::new(MemoryTopicStorage::new());
        for i in 0..2 {
            topics
                .upsert_topic(&crate::storage::records::Topic {
                    id: i.to_string(),
                    user_id: "u1".to_string(),
                    keyword: "k".to_string(),
                    language: None,
                    min_likes: 0,
                    exclude_words: vec![],
                    active: true,
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let ledger = UsageLedger::new(accounts, topics, Arc::new(MemoryUsageStorage::new()));

        // FREE x FREE caps tracked topics at 3.
        assert!(ledger.assert_topic_slots("u1", 1).await.is_ok());
        let err = ledger.assert_topic_slots("u1", 2).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::CapExceeded {
                kind: CapKind::Topics,
                limit: 3
            })
        ));
    }
}
