use serde::{Deserialize, Serialize};

use crate::types::{Cid, PeerId, Timestamp};

/// One schema-validated, signed payload — the unit of exchange.
///
/// Records are immutable once stored; deduplication is by CID. A record is
/// valid iff its signature verifies over `payload` under the producer's
/// identity key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Short ASCII schema identifier, e.g. "OMM".
    pub schema_name: String,
    /// Opaque bytes conforming to the schema.
    pub payload: Vec<u8>,
    /// 64-byte Ed25519 (or Secp256k1) signature over `payload`.
    pub signature: Vec<u8>,
    /// Stable identifier of the producing peer.
    pub producer: PeerId,
    /// When this node first received the record.
    pub received_at: Timestamp,
}

impl Record {
    /// Derived content identifier: SHA-256 of the payload.
    pub fn cid(&self) -> Cid {
        Cid::of(&self.payload)
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("schema", &self.schema_name)
            .field("cid", &self.cid())
            .field("payload_len", &self.payload.len())
            .field("producer", &self.producer)
            .finish()
    }
}
