//! Work queue abstraction for job dispatch.
//!
//! One queue exists per job kind. The in-memory MPSC implementation serves
//! single-instance deployments and tests; the Redis implementation
//! distributes jobs across instances with at-least-once delivery via a
//! per-worker in-progress list.

use anyhow::Result;
use async_trait::async_trait;

mod mpsc;
mod redis;

pub use mpsc::MpscQueueAdapter;
pub use redis::RedisQueueAdapter;

#[async_trait]
pub trait QueueAdapter<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Pull the next job. Blocks until one is available for the MPSC
    /// implementation; returns `None` immediately on an empty Redis queue so
    /// workers can poll with their own cadence.
    async fn pull(&self) -> Option<T>;

    async fn push(&self, work: T) -> Result<()>;

    /// Confirm a pulled job finished. A no-op for queues without delivery
    /// guarantees.
    async fn ack(&self, _item: &T) -> Result<()> {
        Ok(())
    }

    /// Approximate number of queued jobs, when the backend can report it.
    async fn depth(&self) -> Option<usize> {
        None
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn QueueAdapter<String>) {}
        fn _assert_sendable(_: Arc<dyn QueueAdapter<String>>) {}
    }
}
