//! Job processors and the dispatch surface around them.
//!
//! Three processors exist, one per job kind: discovery (find candidate
//! posts), engagement (reply/like/follow), and auto-post (scheduled original
//! posts). Each is a free function taking the injected service bundle, so
//! workers, manual triggers, and tests all call the same code path.

pub mod autopost;
pub mod context;
pub mod discovery;
pub mod engagement;
pub mod enqueue;
pub mod worker;

pub use autopost::{AutoPostOptions, AutoPostOutcome, run_auto_post, run_auto_post_for_user};
pub use context::{PacingPolicy, Services};
pub use discovery::{DiscoveryOutcome, run_discovery};
pub use engagement::{EngagementOutcome, run_engagement};
pub use enqueue::{JobHandle, JobKind, JobPayload, JobQueues};
pub use worker::WorkerPool;
