use ed25519_dalek::{Signer as _, SigningKey};
use rand::RngCore;
use zeroize::Zeroize;

use sdn_core::PeerId;

/// The node's Ed25519 identity.
///
/// Holds the 32-byte seed; the same seed backs both record signing and the
/// transport identity, so signatures made here verify against the node's
/// peer id. The seed is wiped on drop.
pub struct NodeSigner {
    seed: [u8; 32],
    signing_key: SigningKey,
}

impl NodeSigner {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Restore an identity from a stored 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        Self { seed, signing_key }
    }

    /// Sign arbitrary bytes; always returns a 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Raw Ed25519 public key (32 bytes).
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The transport keypair derived from the same seed.
    pub fn libp2p_keypair(&self) -> libp2p::identity::Keypair {
        let mut seed = self.seed;
        libp2p::identity::Keypair::ed25519_from_bytes(&mut seed)
            .expect("32-byte ed25519 seed is always valid")
    }

    /// The node's peer id in canonical text form.
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.libp2p_keypair().public().to_peer_id().to_string())
    }

    /// Read-only view of the seed (for persisting the identity file).
    pub fn seed_bytes(&self) -> &[u8; 32] {
        &self.seed
    }
}

impl Drop for NodeSigner {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

impl std::fmt::Debug for NodeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeSigner {{ peer_id: {} }}", self.peer_id())
    }
}
