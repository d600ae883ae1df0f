//! Entity types shared by every storage implementation.
//!
//! Enums are persisted as their `as_str` form in TEXT columns and parsed back
//! with `FromStr`, so the Postgres and in-memory backends agree on the wire
//! representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StorageError;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = StorageError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(StorageError::InvalidInput {
                        details: format!("unknown {} value: {}", stringify!($name), other),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(InternalPlan {
    Free => "FREE",
    Pro => "PRO",
    Team => "TEAM",
});

text_enum!(XPaidTier {
    Free => "FREE",
    Basic => "BASIC",
    Pro => "PRO",
    Enterprise => "ENTERPRISE",
});

text_enum!(UsageAction {
    Reply => "REPLY",
    Like => "LIKE",
    Tweet => "TWEET",
    Follow => "FOLLOW",
    Discovery => "DISCOVERY",
});

text_enum!(ModerationStatus {
    Unreviewed => "UNREVIEWED",
    Passed => "PASSED",
    Blocked => "BLOCKED",
});

text_enum!(ReplyTone {
    Professional => "PROFESSIONAL",
    Witty => "WITTY",
    Insightful => "INSIGHTFUL",
});

text_enum!(CtaStyle {
    Soft => "SOFT",
    Direct => "DIRECT",
    None => "NONE",
});

text_enum!(LogStatus {
    Success => "success",
    Blocked => "blocked",
    Error => "error",
    Info => "info",
});

/// A registered account in our own system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub internal_plan: InternalPlan,
}

/// One-per-user link to the external X account. Tokens are stored only in
/// encrypted form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub user_id: String,
    pub x_user_id: String,
    pub handle: Option<String>,
    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub x_paid_tier: XPaidTier,
}

/// "Bring your own app": user-supplied OAuth client overriding the
/// process-wide defaults. Client id and secret are stored encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppCredential {
    pub user_id: String,
    pub client_id_enc: String,
    pub client_secret_enc: Option<String>,
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub user_id: String,
    pub keyword: String,
    pub language: Option<String>,
    pub min_likes: i64,
    pub exclude_words: Vec<String>,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

/// A discovered post matching a tracked topic, awaiting or having received
/// engagement. Unique per (user_id, post_id); never deleted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub user_id: String,
    pub post_id: String,
    pub author_id: String,
    pub author_handle: Option<String>,
    pub text: String,
    pub language: Option<String>,
    pub like_count: i64,
    pub discovered_at: DateTime<Utc>,
    pub reply_text: Option<String>,
    pub replied_at: Option<DateTime<Utc>>,
    pub liked_at: Option<DateTime<Utc>>,
    pub followed_at: Option<DateTime<Utc>>,
    pub moderation_status: ModerationStatus,
    pub duplicate_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCandidate {
    pub user_id: String,
    pub post_id: String,
    pub author_id: String,
    pub author_handle: Option<String>,
    pub text: String,
    pub language: Option<String>,
    pub like_count: i64,
    pub duplicate_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    pub user_id: String,
    pub tone: ReplyTone,
    pub cta_style: CtaStyle,
    pub bio_context: Option<String>,
    pub like_on_reply: bool,
    pub follow_on_reply: bool,
}

impl ReplyConfig {
    /// Behavior applied when the user never saved a config.
    pub fn default_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            tone: ReplyTone::Professional,
            cta_style: CtaStyle::Soft,
            bio_context: None,
            like_on_reply: true,
            follow_on_reply: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoPostConfig {
    pub user_id: String,
    pub topics: Vec<String>,
    pub frequency_minutes: i64,
    pub window_start: String,
    pub window_end: String,
    pub thread_mode: bool,
    pub language: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedPost {
    pub id: String,
    pub user_id: String,
    pub text: String,
    pub thread_parts: Vec<String>,
    pub x_post_id: Option<String>,
    pub source_topic: Option<String>,
    pub status: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGeneratedPost {
    pub user_id: String,
    pub text: String,
    pub thread_parts: Vec<String>,
    pub x_post_id: String,
    pub source_topic: Option<String>,
}

/// Closed, versioned metadata attached to a usage event. One variant per
/// action kind keeps test assertions precise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsageMeta {
    Reply { post_id: String },
    Like { post_id: String },
    Follow { author_id: String },
    Tweet { post_id: String, fingerprint: String },
    Discovery { topic_id: String, keyword: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub user_id: String,
    pub action: UsageAction,
    pub created_at: DateTime<Utc>,
    pub meta: UsageMeta,
}

/// Structured context attached to an action log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogContext {
    None,
    Discovery {
        discovered: u32,
        skipped: u32,
        blocked: u32,
    },
    Engagement {
        replied: u32,
        liked: u32,
        followed: u32,
        blocked: u32,
    },
    AutoPost {
        posted_ids: Vec<String>,
        blocked: u32,
        reason: Option<String>,
    },
    Candidate {
        post_id: String,
    },
    Author {
        author_id: String,
    },
}

/// Append-only audit entry. Written by every processor, never read back by
/// the core logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub user_id: String,
    pub action: String,
    pub status: LogStatus,
    pub message: Option<String>,
    pub context: LogContext,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn enum_round_trips() {
        for plan in [InternalPlan::Free, InternalPlan::Pro, InternalPlan::Team] {
            assert_eq!(InternalPlan::from_str(plan.as_str()).unwrap(), plan);
        }
        for action in [
            UsageAction::Reply,
            UsageAction::Like,
            UsageAction::Tweet,
            UsageAction::Follow,
            UsageAction::Discovery,
        ] {
            assert_eq!(UsageAction::from_str(action.as_str()).unwrap(), action);
        }
        assert!(InternalPlan::from_str("GOLD").is_err());
    }

    #[test]
    fn usage_meta_serializes_with_kind_tag() {
        let meta = UsageMeta::Tweet {
            post_id: "1234".to_string(),
            fingerprint: "abcd".to_string(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["kind"], "tweet");
        assert_eq!(json["post_id"], "1234");

        let parsed: UsageMeta = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn default_reply_config_matches_product_defaults() {
        let config = ReplyConfig::default_for("u1");
        assert_eq!(config.tone, ReplyTone::Professional);
        assert_eq!(config.cta_style, CtaStyle::Soft);
        assert!(config.like_on_reply);
        assert!(!config.follow_on_reply);
    }
}
