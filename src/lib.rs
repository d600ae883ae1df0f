//! # xgrowth
//!
//! xgrowth is an X (Twitter) growth automation engine. On behalf of many
//! independent user accounts it discovers candidate posts matching tracked
//! topics, generates and posts AI-assisted replies (with optional likes and
//! follows), and periodically publishes AI-generated original posts.
//!
//! ## Architecture Overview
//!
//! The engine is built around three per-user job processors dispatched by a
//! queue with worker-pool concurrency:
//!
//! - **Discovery** searches the recent-post endpoint per tracked topic and
//!   persists deduplicated candidates.
//! - **Engagement** replies to pending candidates under hard-cap control,
//!   with best-effort likes and follows.
//! - **Auto-post** publishes scheduled original posts (optionally threaded)
//!   behind a per-user distributed lock.
//!
//! Correctness under concurrency and partial failure rests on three pieces:
//!
//! - the **usage ledger** combines two independent tier tables into per-user
//!   hard caps and enforces them against windowed usage counts;
//! - the **token lifecycle manager** refreshes OAuth access tokens against
//!   the X authorization server, trying multiple client-authentication
//!   strategies before giving up;
//! - **persisted dedup state** (candidate uniqueness, content fingerprints,
//!   a TTL-bounded seen set) makes every processor safe to re-run after a
//!   partial failure, which is what the job framework's retries assume.
//!
//! Capabilities (storage, cache/locks, AI generation, the X API, the secrets
//! codec) are consumed through traits and injected via a service bundle;
//! each has a production implementation and an in-memory one for
//! single-instance degraded mode and deterministic tests.
//!
//! ## Error Handling
//!
//! All error strings use the format: `error-xgrowth-<domain>-<number> <message>`.
//! The engine taxonomy distinguishes non-retryable failures (bad
//! credentials, plan restrictions, upstream network blocks) from retryable
//! ones; only the latter reach the job framework's retry loop.

/// AI text generation and moderation capability.
pub mod ai;

/// Configuration management, loaded from environment variables.
pub mod config;

pub(crate) mod constants;

/// Distributed coordination: locks, seen-sets, ephemeral state.
pub mod coordination;

pub(crate) mod errors;

pub use errors::{CapKind, ConfigError, EngineError, QueueError, SecretsError, StorageError};

/// Per-user hard caps and the usage ledger behind them.
pub mod limits;

/// Static limit tables for both tier systems.
pub mod plans;

/// Job processors, the service bundle, triggers, and worker pools.
pub mod jobs;

/// Queue adapter abstractions with MPSC and Redis implementations.
pub mod queue_adapter;

/// Encrypt/decrypt capability for stored credentials.
pub mod secrets;

/// Storage traits with PostgreSQL and in-memory implementations.
pub mod storage;

/// Text normalization, fingerprinting, and pacing utilities.
pub mod text;

/// X API client, OAuth plumbing, and token lifecycle.
pub mod x;

#[cfg(test)]
pub mod test_helpers;
