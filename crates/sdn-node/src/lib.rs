//! sdn-node
//!
//! The node orchestrator: wires storage, trust, auth, subscriptions, the tip
//! queue, and the swarm together; owns startup order and bounded shutdown.
//! Multiple nodes may coexist in one process (tests and simulators do this).

pub mod config;
pub mod node;

pub use config::{NodeConfig, TrustEntryConfig};
pub use node::{identity_cid, Node};
