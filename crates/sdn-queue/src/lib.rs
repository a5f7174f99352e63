//! sdn-queue
//!
//! The PNM pipeline: tips, policy-driven fetch scheduling on a bounded
//! priority worker pool, pinning, and tip garbage collection.

pub mod publish;
pub mod queue;
pub mod tip;

pub use publish::{build_pnm, build_pnm_at};
pub use queue::{TipQueue, TipQueueConfig};
pub use tip::{ContentFetcher, FetchedRecord, Tip};
