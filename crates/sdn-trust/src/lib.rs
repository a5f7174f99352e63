//! sdn-trust
//!
//! Peer admission: trust levels, dial gating, per-trust protocol caps,
//! fixed-window rate limiting, and failure-driven quarantine.

pub mod limits;
pub mod registry;

pub use limits::{default_limits, RateTable, TokenBucket, TrustLimits};
pub use registry::{ConfigEntry, FailureTracker, TrustRegistry};
