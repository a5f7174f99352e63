//! sdn-schema
//!
//! The schema registry: maps short schema names ("OMM", "CDM", …) to
//! validators and canonical gossip topic names. Payload field access for
//! queries and filters goes through the `PayloadFields` seam.

pub mod registry;

pub use registry::{
    lookup_path, JsonFields, PayloadFields, SchemaDescriptor, SchemaRegistry, ValidationMode,
    Validator,
};
