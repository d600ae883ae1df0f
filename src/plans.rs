//! Static limit tables and the effective-limit combinator.
//!
//! Two independent tier systems constrain every user: our own subscription
//! plan and the paid tier detected on the connected X account. The effective
//! limit for any action is the field-wise minimum of both tables, and follow
//! is only available when both tables allow it.

use crate::storage::records::{InternalPlan, XPaidTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub replies_per_day: i64,
    pub tweets_per_day: i64,
    pub likes_per_day: i64,
    pub topics_tracked: i64,
    pub hourly_action_cap: i64,
    pub allow_follow: bool,
}

const fn internal_plan_limits(plan: InternalPlan) -> EffectiveLimits {
    match plan {
        InternalPlan::Free => EffectiveLimits {
            replies_per_day: 20,
            tweets_per_day: 5,
            likes_per_day: 30,
            topics_tracked: 5,
            hourly_action_cap: 12,
            allow_follow: false,
        },
        InternalPlan::Pro => EffectiveLimits {
            replies_per_day: 120,
            tweets_per_day: 30,
            likes_per_day: 150,
            topics_tracked: 30,
            hourly_action_cap: 60,
            allow_follow: true,
        },
        InternalPlan::Team => EffectiveLimits {
            replies_per_day: 400,
            tweets_per_day: 120,
            likes_per_day: 500,
            topics_tracked: 100,
            hourly_action_cap: 220,
            allow_follow: true,
        },
    }
}

const fn x_tier_limits(tier: XPaidTier) -> EffectiveLimits {
    match tier {
        XPaidTier::Free => EffectiveLimits {
            replies_per_day: 10,
            tweets_per_day: 5,
            likes_per_day: 20,
            topics_tracked: 3,
            hourly_action_cap: 8,
            allow_follow: false,
        },
        XPaidTier::Basic => EffectiveLimits {
            replies_per_day: 100,
            tweets_per_day: 25,
            likes_per_day: 120,
            topics_tracked: 20,
            hourly_action_cap: 45,
            allow_follow: false,
        },
        XPaidTier::Pro => EffectiveLimits {
            replies_per_day: 500,
            tweets_per_day: 150,
            likes_per_day: 800,
            topics_tracked: 200,
            hourly_action_cap: 250,
            allow_follow: true,
        },
        XPaidTier::Enterprise => EffectiveLimits {
            replies_per_day: 5000,
            tweets_per_day: 2000,
            likes_per_day: 10000,
            topics_tracked: 1000,
            hourly_action_cap: 1000,
            allow_follow: true,
        },
    }
}

/// Combine both tier tables into the per-user limit set. Pure; total over
/// every valid tier pair.
pub fn effective_limits(internal: InternalPlan, x_tier: XPaidTier) -> EffectiveLimits {
    let a = internal_plan_limits(internal);
    let b = x_tier_limits(x_tier);
    EffectiveLimits {
        replies_per_day: a.replies_per_day.min(b.replies_per_day),
        tweets_per_day: a.tweets_per_day.min(b.tweets_per_day),
        likes_per_day: a.likes_per_day.min(b.likes_per_day),
        topics_tracked: a.topics_tracked.min(b.topics_tracked),
        hourly_action_cap: a.hourly_action_cap.min(b.hourly_action_cap),
        allow_follow: a.allow_follow && b.allow_follow,
    }
}
