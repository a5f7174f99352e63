//! Narrow capability interfaces passed between components.
//!
//! Components never hold the node directly; the node hands each one only the
//! capability it needs, which keeps shutdown strictly top-down and the
//! ownership graph acyclic.

use crate::record::Record;
use crate::types::PeerId;

/// Delivery of a received record to matching subscriptions.
///
/// `encrypted` reflects the routing header of the carrying message; filters
/// cannot see into encrypted payloads, and subscriptions opt in via their
/// encryption mode.
pub trait SubscriptionDispatcher: Send + Sync {
    fn dispatch(&self, record: &Record, from: &PeerId, encrypted: bool);
}

/// Publication of a locally produced record's availability notification.
pub trait TipPublisher: Send + Sync {
    fn publish_tip(&self, record: &Record) -> Result<(), crate::error::SdnError>;
}
