use std::time::Duration;

use async_trait::async_trait;

use sdn_core::{Cid, PeerId, Pnm, ResolvedPolicy, SdnError, Timestamp};

/// A PNM enriched with local fetch/pin metadata. Keyed by CID; the same CID
/// announced by multiple peers stays one tip, with later announcers kept as
/// alternate fetch sources.
#[derive(Debug, Clone)]
pub struct Tip {
    pub pnm: Pnm,
    pub received_at: Timestamp,
    pub fetched: bool,
    pub pinned: bool,
    pub pin_expiry: Option<Timestamp>,
    pub seen_count: u32,
    pub attempts: u32,
    pub failed: bool,
    /// Additional announcing sources: (peer, multiaddr).
    pub alternates: Vec<(PeerId, String)>,
    pub policy: ResolvedPolicy,
}

impl Tip {
    pub fn new(pnm: Pnm, received_at: Timestamp, policy: ResolvedPolicy) -> Self {
        Self {
            pnm,
            received_at,
            fetched: false,
            pinned: false,
            pin_expiry: None,
            seen_count: 1,
            attempts: 0,
            failed: false,
            alternates: Vec::new(),
            policy,
        }
    }

    /// Fetch sources in try-order: the announcing producer first, then
    /// alternates.
    pub fn sources(&self) -> Vec<(PeerId, String)> {
        let mut out = Vec::with_capacity(1 + self.alternates.len());
        out.push((self.pnm.producer.clone(), self.pnm.multi_addr.clone()));
        out.extend(self.alternates.iter().cloned());
        out
    }
}

/// Record bytes and producer signature as returned by a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRecord {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Strategy for retrieving announced record bytes.
///
/// The shipped implementation drives the SDS Exchange request-response
/// protocol (directly or through an advertised circuit relay); an
/// alternative content network slots in behind this trait without queue
/// changes.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(
        &self,
        producer: &PeerId,
        multiaddr: &str,
        cid: &Cid,
        schema: &str,
        timeout: Duration,
    ) -> Result<FetchedRecord, SdnError>;
}
