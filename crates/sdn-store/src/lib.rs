//! sdn-store
//!
//! The content-addressed record store: SQLite-backed, one table per schema,
//! CID-keyed with cross-schema deduplication, and queryable by payload
//! fields through the schema layer's dotted-path decoder.

pub mod store;

pub use store::{PutOutcome, QueryOrder, SchemaStats, Store};
