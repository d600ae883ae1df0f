//! Worker pools that drain the job queues.
//!
//! Each job kind gets its own pool with a fixed concurrency. Retryable
//! failures are retried in place with exponential backoff, a bounded number
//! of times; non-retryable failures and cap exhaustion were already logged by
//! the processor and are not retried. Processors are safe to re-run on a
//! partially-completed prior attempt, which is what makes in-place retry
//! sound.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{
    AUTOPOST_CONCURRENCY, DISCOVERY_CONCURRENCY, ENGAGEMENT_CONCURRENCY, JOB_BACKOFF_BASE_MS,
    JOB_MAX_ATTEMPTS,
};
use crate::errors::{is_cap_exceeded, is_non_retryable};
use crate::jobs::autopost::run_auto_post_for_user;
use crate::jobs::context::Services;
use crate::jobs::discovery::run_discovery;
use crate::jobs::engagement::run_engagement;
use crate::jobs::enqueue::{JobKind, JobPayload};
use crate::queue_adapter::QueueAdapter;

/// Idle delay between polls when a queue reports empty without blocking.
const IDLE_POLL_MS: u64 = 500;

async fn run_job(services: &Services, payload: &JobPayload) -> anyhow::Result<String> {
    match payload.kind {
        JobKind::Discovery => {
            let outcome = run_discovery(services, &payload.user_id).await?;
            Ok(format!(
                "discovered={} skipped={} blocked={}",
                outcome.discovered, outcome.skipped, outcome.blocked
            ))
        }
        JobKind::Engagement => {
            let outcome = run_engagement(services, &payload.user_id).await?;
            Ok(format!(
                "replied={} liked={} followed={} blocked={}",
                outcome.replied, outcome.liked, outcome.followed, outcome.blocked
            ))
        }
        JobKind::AutoPost => {
            let outcome = run_auto_post_for_user(services, &payload.user_id).await?;
            Ok(format!(
                "posted={} skipped={} blocked={}",
                outcome.posted, outcome.skipped, outcome.blocked
            ))
        }
    }
}

/// Execute one job with bounded in-place retries for retryable failures.
pub async fn process_with_retries(services: &Services, payload: &JobPayload) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match run_job(services, payload).await {
            Ok(summary) => {
                info!(
                    kind = payload.kind.as_str(),
                    user_id = %payload.user_id,
                    %summary,
                    "Job completed"
                );
                return;
            }
            Err(err) if is_non_retryable(&err) || is_cap_exceeded(&err) => {
                // The processor already logged a blocked outcome.
                warn!(
                    kind = payload.kind.as_str(),
                    user_id = %payload.user_id,
                    error = %err,
                    "Job failed terminally, not retrying"
                );
                return;
            }
            Err(err) if attempt < JOB_MAX_ATTEMPTS => {
                let backoff = JOB_BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
                warn!(
                    kind = payload.kind.as_str(),
                    user_id = %payload.user_id,
                    attempt,
                    backoff_ms = backoff,
                    error = %err,
                    "Job failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            Err(err) => {
                error!(
                    kind = payload.kind.as_str(),
                    user_id = %payload.user_id,
                    attempts = attempt,
                    error = %err,
                    "Job failed after all retries"
                );
                return;
            }
        }
    }
}

/// A set of worker tasks draining one queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        kind: JobKind,
        queue: Arc<dyn QueueAdapter<JobPayload>>,
        services: Services,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        let mut handles = Vec::with_capacity(concurrency);
        for worker_index in 0..concurrency {
            let queue = queue.clone();
            let services = services.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                debug!(kind = kind.as_str(), worker_index, "Worker started");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        pulled = queue.pull() => match pulled {
                            Some(payload) => {
                                process_with_retries(&services, &payload).await;
                                if let Err(err) = queue.ack(&payload).await {
                                    warn!(error = %err, "Failed to acknowledge job");
                                }
                            }
                            None => {
                                tokio::time::sleep(Duration::from_millis(IDLE_POLL_MS)).await;
                            }
                        },
                    }
                }
                debug!(kind = kind.as_str(), worker_index, "Worker stopped");
            }));
        }
        Self { handles }
    }

    /// Default concurrency for a job kind.
    pub fn default_concurrency(kind: JobKind) -> usize {
        match kind {
            JobKind::Discovery => DISCOVERY_CONCURRENCY,
            JobKind::Engagement => ENGAGEMENT_CONCURRENCY,
            JobKind::AutoPost => AUTOPOST_CONCURRENCY,
        }
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
