use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Unix timestamp (seconds, UTC).
pub type Timestamp = i64;

// ── Cid ──────────────────────────────────────────────────────────────────────

/// Content identifier: SHA-256 of the record payload, 32 bytes.
///
/// The canonical text form is lowercase hex; that is also what travels on the
/// wire inside `RequestData` payloads and PNM announcements.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid(pub [u8; 32]);

impl Cid {
    /// Derive the CID of a payload.
    pub fn of(payload: &[u8]) -> Self {
        let digest = Sha256::digest(payload);
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&digest);
        Self(arr)
    }

    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({}…)", &self.to_hex()[..16])
    }
}

// ── PeerId ───────────────────────────────────────────────────────────────────

/// A peer's stable cryptographic identifier in its canonical text form
/// (base58 multihash, as printed by the transport layer).
///
/// The identifier embeds the peer's public key; `sdn-crypto` extracts it for
/// signature verification. Core code treats the id as an opaque ordered key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail = if self.0.len() > 8 { &self.0[self.0.len() - 8..] } else { &self.0 };
        write!(f, "PeerId(…{tail})")
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── TrustLevel ───────────────────────────────────────────────────────────────

/// Ordered admission class of a peer. Gates dials, rate limits, and query
/// access. Unknown peers default to `Untrusted`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum TrustLevel {
    Untrusted,
    Limited,
    Standard,
    Trusted,
    Admin,
}

impl Default for TrustLevel {
    fn default() -> Self {
        TrustLevel::Untrusted
    }
}

impl TrustLevel {
    /// Parse the operator-config spelling ("standard", "Trusted", …).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "untrusted" => Some(TrustLevel::Untrusted),
            "limited" => Some(TrustLevel::Limited),
            "standard" => Some(TrustLevel::Standard),
            "trusted" => Some(TrustLevel::Trusted),
            "admin" => Some(TrustLevel::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Limited => "limited",
            TrustLevel::Standard => "standard",
            TrustLevel::Trusted => "trusted",
            TrustLevel::Admin => "admin",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── SignatureType ────────────────────────────────────────────────────────────

/// Signature algorithm declared by a PNM producer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SignatureType {
    Ed25519,
    Secp256k1,
    /// Ethereum-style Secp256k1 over a keccak prefix; verified on the
    /// Secp256k1 path.
    Eth,
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignatureType::Ed25519 => "Ed25519",
            SignatureType::Secp256k1 => "Secp256k1",
            SignatureType::Eth => "ETH",
        };
        write!(f, "{s}")
    }
}
