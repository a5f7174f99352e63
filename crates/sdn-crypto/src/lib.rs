//! sdn-crypto
//!
//! Signing and verification for SDN records and peer identities. The node
//! signs with Ed25519; verification extracts the public key embedded in the
//! sender's peer id and selects the algorithm by key type.

pub mod signer;
pub mod verifier;

pub use signer::NodeSigner;
pub use verifier::{is_valid_ed25519_pubkey, public_key_of, verify_ed25519, verify_from_peer};
