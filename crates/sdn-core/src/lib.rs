//! sdn-core
//!
//! Shared data model for the Space Data Network: content identifiers,
//! records, publication notifications, trust levels, the policy hierarchy,
//! the error taxonomy, and the outbound event stream. No I/O lives here.

pub mod caps;
pub mod constants;
pub mod error;
pub mod event;
pub mod filter;
pub mod pnm;
pub mod policy;
pub mod record;
pub mod types;

pub use caps::{SubscriptionDispatcher, TipPublisher};
pub use constants::*;
pub use error::SdnError;
pub use event::{ChannelSink, EventSink, NodeEvent, NullSink};
pub use filter::{FilterOp, Predicate};
pub use pnm::{Pnm, RelayAnnouncement};
pub use policy::{PolicyConfig, PolicyEntry, ResolvedPolicy, SourcePolicy, SystemDefaults};
pub use record::Record;
pub use types::{Cid, PeerId, SignatureType, Timestamp, TrustLevel};
