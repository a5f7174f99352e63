use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};
use libp2p::identity::PublicKey;

use sdn_core::{PeerId, SdnError};

/// Multihash code of the identity hash. Ed25519 and Secp256k1 peer ids embed
/// their public key under this code, which is what makes key extraction from
/// a bare peer id possible.
const IDENTITY_MULTIHASH_CODE: u64 = 0x00;

/// Extract the public key embedded in a peer id.
///
/// Fails with `InvalidSignature` when the id does not parse or carries a
/// hashed (non-extractable) key; no more specific detail is leaked.
pub fn public_key_of(peer: &PeerId) -> Result<PublicKey, SdnError> {
    let parsed: libp2p::PeerId =
        peer.as_str().parse().map_err(|_| SdnError::InvalidSignature)?;
    let mh: libp2p::multihash::Multihash<64> = parsed.into();
    if mh.code() != IDENTITY_MULTIHASH_CODE {
        return Err(SdnError::InvalidSignature);
    }
    PublicKey::try_decode_protobuf(mh.digest()).map_err(|_| SdnError::InvalidSignature)
}

/// Verify `signature` over `message` under the key embedded in `peer`.
///
/// The algorithm is selected by the key type the peer id carries. Ed25519
/// signatures are the 64-byte form; Secp256k1 accepts both the DER encoding
/// the transport layer produces and the compact 64-byte form PNMs carry
/// (ETH-flagged signatures ride this path too). Every failure mode collapses
/// to `InvalidSignature`.
pub fn verify_from_peer(peer: &PeerId, message: &[u8], signature: &[u8]) -> Result<(), SdnError> {
    let key = public_key_of(peer)?;
    if key.verify(message, signature) {
        return Ok(());
    }
    // Compact Secp256k1 fallback: libp2p only checks DER.
    if let Ok(secp) = key.clone().try_into_secp256k1() {
        return verify_secp256k1_compact(&secp.to_bytes(), message, signature);
    }
    Err(SdnError::InvalidSignature)
}

/// Verify a compact (64-byte r||s) Secp256k1 ECDSA signature over the
/// SHA-256 digest of `message`.
pub fn verify_secp256k1_compact(
    pubkey_sec1: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), SdnError> {
    use k256::ecdsa::signature::Verifier as _;
    let key = k256::ecdsa::VerifyingKey::from_sec1_bytes(pubkey_sec1)
        .map_err(|_| SdnError::InvalidSignature)?;
    let sig = k256::ecdsa::Signature::from_slice(signature)
        .map_err(|_| SdnError::InvalidSignature)?;
    key.verify(message, &sig).map_err(|_| SdnError::InvalidSignature)
}

/// Verify a raw Ed25519 signature under a 32-byte public key.
///
/// Used by the auth core, where clients present hex public keys rather than
/// peer ids.
pub fn verify_ed25519(pubkey: &[u8], message: &[u8], signature: &[u8]) -> Result<(), SdnError> {
    let key_arr: [u8; 32] = pubkey.try_into().map_err(|_| SdnError::InvalidSignature)?;
    let key = VerifyingKey::from_bytes(&key_arr).map_err(|_| SdnError::InvalidSignature)?;
    let sig_arr: [u8; 64] = signature.try_into().map_err(|_| SdnError::InvalidSignature)?;
    let sig = Signature::from_bytes(&sig_arr);
    key.verify(message, &sig).map_err(|_| SdnError::InvalidSignature)
}

/// Check that `bytes` is a syntactically valid 32-byte Ed25519 public key.
pub fn is_valid_ed25519_pubkey(bytes: &[u8]) -> bool {
    match <[u8; 32]>::try_from(bytes) {
        Ok(arr) => VerifyingKey::from_bytes(&arr).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::NodeSigner;

    #[test]
    fn sign_then_verify_via_peer_id() {
        let signer = NodeSigner::generate();
        let msg = b"OMM payload bytes";
        let sig = signer.sign(msg);
        verify_from_peer(&signer.peer_id(), msg, &sig).unwrap();
    }

    #[test]
    fn tampered_message_fails() {
        let signer = NodeSigner::generate();
        let sig = signer.sign(b"original");
        assert!(matches!(
            verify_from_peer(&signer.peer_id(), b"tampered", &sig),
            Err(SdnError::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_peer_fails() {
        let signer = NodeSigner::generate();
        let other = NodeSigner::generate();
        let sig = signer.sign(b"message");
        assert!(matches!(
            verify_from_peer(&other.peer_id(), b"message", &sig),
            Err(SdnError::InvalidSignature)
        ));
    }

    #[test]
    fn garbage_peer_id_fails_uniformly() {
        assert!(matches!(
            verify_from_peer(&PeerId::new("not-a-peer-id"), b"m", &[0u8; 64]),
            Err(SdnError::InvalidSignature)
        ));
    }

    #[test]
    fn secp256k1_peer_key_verifies() {
        let kp = libp2p::identity::Keypair::generate_secp256k1();
        let peer = PeerId::new(kp.public().to_peer_id().to_string());
        let msg = b"conjunction warning";
        let sig = kp.sign(msg).unwrap();
        verify_from_peer(&peer, msg, &sig).unwrap();
        assert!(verify_from_peer(&peer, b"other", &sig).is_err());
    }

    #[test]
    fn compact_secp256k1_signature_verifies() {
        use k256::ecdsa::{signature::Signer as _, Signature, SigningKey};
        let sk = SigningKey::random(&mut rand::thread_rng());
        let secret = libp2p::identity::secp256k1::SecretKey::try_from_bytes(
            sk.to_bytes().as_slice().to_vec(),
        )
        .unwrap();
        let kp: libp2p::identity::Keypair =
            libp2p::identity::secp256k1::Keypair::from(secret).into();
        let peer = PeerId::new(kp.public().to_peer_id().to_string());

        let msg = b"maneuver notice";
        let sig: Signature = sk.sign(msg);
        verify_from_peer(&peer, msg, &sig.to_bytes()).unwrap();
    }

    #[test]
    fn raw_ed25519_helper_round_trip() {
        let signer = NodeSigner::generate();
        let sig = signer.sign(b"nonce");
        verify_ed25519(&signer.public_key_bytes(), b"nonce", &sig).unwrap();
        assert!(verify_ed25519(&signer.public_key_bytes(), b"other", &sig).is_err());
        assert!(is_valid_ed25519_pubkey(&signer.public_key_bytes()));
        assert!(!is_valid_ed25519_pubkey(&[0u8; 31]));
    }
}
