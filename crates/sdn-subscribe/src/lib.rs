//! sdn-subscribe
//!
//! Subscription registry and dispatch: per-subscriber schema/source/field
//! filters, Single/Streaming/Batch delivery modes, per-subscription rate
//! buckets, and session-scoped lifetimes.

pub mod manager;

pub use manager::{
    EncryptionMode, SubscriptionConfig, SubscriptionEvent, SubscriptionInfo, SubscriptionManager,
    SubscriptionMode, SubscriptionPatch, SubscriptionStatus, WILDCARD,
};
