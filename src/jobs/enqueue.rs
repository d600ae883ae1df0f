//! Idempotent job triggers.
//!
//! Trigger ids are derived from `(job kind, user, minute bucket)`, and a slot
//! claim in the coordination cache collapses rapid re-triggers within the
//! same bucket to a single queued job. The returned handle carries the slot
//! id either way, so callers cannot tell a fresh enqueue from a collapsed
//! one, which is the point.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::constants::JOB_SLOT_BUCKET_SECS;
use crate::coordination::CoordinationCache;
use crate::queue_adapter::QueueAdapter;
use crate::storage::cache::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Discovery,
    Engagement,
    AutoPost,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discover",
            Self::Engagement => "engage",
            Self::AutoPost => "autopost",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub kind: JobKind,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
}

pub struct JobQueues {
    pub discovery: Arc<dyn QueueAdapter<JobPayload>>,
    pub engagement: Arc<dyn QueueAdapter<JobPayload>>,
    pub autopost: Arc<dyn QueueAdapter<JobPayload>>,
    coordination: Arc<dyn CoordinationCache>,
}

impl JobQueues {
    pub fn new(
        discovery: Arc<dyn QueueAdapter<JobPayload>>,
        engagement: Arc<dyn QueueAdapter<JobPayload>>,
        autopost: Arc<dyn QueueAdapter<JobPayload>>,
        coordination: Arc<dyn CoordinationCache>,
    ) -> Self {
        Self {
            discovery,
            engagement,
            autopost,
            coordination,
        }
    }

    fn queue_for(&self, kind: JobKind) -> &Arc<dyn QueueAdapter<JobPayload>> {
        match kind {
            JobKind::Discovery => &self.discovery,
            JobKind::Engagement => &self.engagement,
            JobKind::AutoPost => &self.autopost,
        }
    }

    async fn enqueue(&self, kind: JobKind, user_id: &str) -> Result<JobHandle> {
        let bucket = Utc::now().timestamp() / JOB_SLOT_BUCKET_SECS;
        let slot_key = keys::job_slot_key(kind.as_str(), user_id, bucket);

        // Hold the slot for two buckets so a claim cannot expire before its
        // bucket ends.
        let claimed = self
            .coordination
            .claim_slot(&slot_key, Duration::from_secs(2 * JOB_SLOT_BUCKET_SECS as u64))
            .await
            .unwrap_or(true);

        if claimed {
            self.queue_for(kind)
                .push(JobPayload {
                    kind,
                    user_id: user_id.to_string(),
                })
                .await?;
        } else {
            debug!(
                kind = kind.as_str(),
                user_id = %user_id,
                "Trigger collapsed into existing job slot"
            );
        }

        Ok(JobHandle { id: slot_key })
    }

    pub async fn enqueue_discovery(&self, user_id: &str) -> Result<JobHandle> {
        self.enqueue(JobKind::Discovery, user_id).await
    }

    pub async fn enqueue_engagement(&self, user_id: &str) -> Result<JobHandle> {
        self.enqueue(JobKind::Engagement, user_id).await
    }

    pub async fn enqueue_autopost(&self, user_id: &str) -> Result<JobHandle> {
        self.enqueue(JobKind::AutoPost, user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordination;
    use crate::queue_adapter::MpscQueueAdapter;

    fn queues() -> (JobQueues, Arc<MpscQueueAdapter<JobPayload>>) {
        let discovery = Arc::new(MpscQueueAdapter::new(16));
        let queues = JobQueues::new(
            discovery.clone(),
            Arc::new(MpscQueueAdapter::new(16)),
            Arc::new(MpscQueueAdapter::new(16)),
            Arc::new(MemoryCoordination::new()),
        );
        (queues, discovery)
    }

    #[tokio::test]
    async fn repeated_triggers_in_one_bucket_queue_once() {
        let (queues, discovery) = queues();

        let first = queues.enqueue_discovery("u1").await.unwrap();
        let second = queues.enqueue_discovery("u1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(discovery.depth().await, Some(1));

        let payload = discovery.pull().await.unwrap();
        assert_eq!(payload.kind, JobKind::Discovery);
        assert_eq!(payload.user_id, "u1");
    }

    #[tokio::test]
    async fn different_users_get_independent_slots() {
        let (queues, discovery) = queues();
        queues.enqueue_discovery("u1").await.unwrap();
        queues.enqueue_discovery("u2").await.unwrap();
        assert_eq!(discovery.depth().await, Some(2));
    }

    #[tokio::test]
    async fn job_kinds_do_not_share_slots() {
        let (queues, discovery) = queues();
        let a = queues.enqueue_discovery("u1").await.unwrap();
        let b = queues.enqueue_engagement("u1").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(discovery.depth().await, Some(1));
    }
}
