//! Application-wide constants

/// Fixed page size for the recent-post search endpoint.
pub(crate) const DISCOVERY_PAGE_SIZE: u32 = 20;

/// How long a discovered post id stays in the short-term seen set.
pub(crate) const SEEN_POST_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Maximum candidates engaged per run.
pub(crate) const ENGAGEMENT_BATCH_SIZE: i64 = 10;

/// How many prior reply texts are passed to generation as an avoid-repeat hint.
pub(crate) const RECENT_REPLY_HINTS: i64 = 20;

/// Recency window used for generated-post dedup. Repeats older than this
/// window are allowed; the bound is intentional, not an unbounded uniqueness
/// constraint.
pub(crate) const RECENT_POST_DEDUP_WINDOW: i64 = 120;

/// Hard length ceiling applied to every generated post segment.
pub(crate) const POST_MAX_CHARS: usize = 280;

/// Maximum segments published per auto-post run in thread mode.
pub(crate) const THREAD_MAX_PARTS: usize = 3;

/// TTL of the per-user auto-post lock.
pub(crate) const AUTOPOST_LOCK_TTL_SECS: u64 = 180;

/// TTL of a pending OAuth authorization (state -> code verifier).
pub(crate) const OAUTH_PENDING_TTL_SECS: u64 = 10 * 60;

/// Window in which repeated triggers for the same user collapse to one job.
pub(crate) const JOB_SLOT_BUCKET_SECS: i64 = 60;

/// Platform-wide daily ceilings, independent of any plan combination.
pub(crate) const X_DAILY_LIKE_CEILING: i64 = 1000;
pub(crate) const X_DAILY_FOLLOW_CEILING: i64 = 400;

/// Safety margin subtracted from the stored token expiry before deciding a
/// refresh is needed.
pub(crate) const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Jitter bounds (milliseconds) applied before outbound side effects.
pub(crate) const JITTER_POST_MIN_MS: u64 = 1500;
pub(crate) const JITTER_POST_MAX_MS: u64 = 7000;
pub(crate) const JITTER_SECONDARY_MIN_MS: u64 = 1000;
pub(crate) const JITTER_SECONDARY_MAX_MS: u64 = 3000;

/// Worker-pool concurrency per job kind.
pub(crate) const DISCOVERY_CONCURRENCY: usize = 3;
pub(crate) const ENGAGEMENT_CONCURRENCY: usize = 3;
pub(crate) const AUTOPOST_CONCURRENCY: usize = 2;

/// Bounded retry policy applied by workers to retryable failures.
pub(crate) const JOB_MAX_ATTEMPTS: u32 = 3;
pub(crate) const JOB_BACKOFF_BASE_MS: u64 = 1000;
