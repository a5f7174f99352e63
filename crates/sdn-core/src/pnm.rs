use serde::{Deserialize, Serialize};

use crate::error::SdnError;
use crate::types::{Cid, PeerId, SignatureType, Timestamp};

/// Publication Notification Message: advertises a record's availability
/// without carrying its bytes.
///
/// Broadcast on the PNM gossip topic; held in the tip queue until the record
/// is fetched or the tip is evicted. `cid_signature` must verify against the
/// hex CID text under the producer's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pnm {
    pub cid: Cid,
    pub schema_name: String,
    pub file_name: Option<String>,
    /// Where to fetch the record (producer's dialable multiaddress).
    pub multi_addr: String,
    pub publish_timestamp: Timestamp,
    /// Producer signature over the hex CID text.
    pub cid_signature: Vec<u8>,
    /// Producer signature over the decimal timestamp text.
    pub timestamp_signature: Vec<u8>,
    pub signature_type: SignatureType,
    pub producer: PeerId,
}

impl Pnm {
    /// The bytes `cid_signature` signs.
    pub fn cid_signing_bytes(&self) -> Vec<u8> {
        self.cid.to_hex().into_bytes()
    }

    /// The bytes `timestamp_signature` signs.
    pub fn timestamp_signing_bytes(&self) -> Vec<u8> {
        self.publish_timestamp.to_string().into_bytes()
    }

    /// Serialize for gossip propagation.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("Pnm serialization is infallible")
    }

    /// Deserialize from gossip bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SdnError> {
        bincode::deserialize(bytes).map_err(|e| SdnError::Serialization(e.to_string()))
    }
}

/// Edge-relay advertisement carried on the `/<prefix>/edge-relays` topic.
///
/// Nodes keep a bounded most-recent set and use the advertised relays to
/// build `/p2p-circuit` dial addresses when a producer is not directly
/// reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAnnouncement {
    pub peer_id: PeerId,
    pub multiaddrs: Vec<String>,
    pub published_at: Timestamp,
}

impl RelayAnnouncement {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("RelayAnnouncement serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SdnError> {
        bincode::deserialize(bytes).map_err(|e| SdnError::Serialization(e.to_string()))
    }
}
