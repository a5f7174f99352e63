use std::collections::VecDeque;
use std::sync::Mutex;

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};

use sdn_core::RelayAnnouncement;

/// Bounded most-recent set of advertised edge relays.
///
/// Fed from the `/<prefix>/edge-relays` gossip topic; consulted to build
/// `/p2p-circuit` dial addresses when a producer is not directly reachable.
pub struct RelayBook {
    cap: usize,
    entries: Mutex<VecDeque<RelayAnnouncement>>,
}

impl RelayBook {
    pub fn new(cap: usize) -> Self {
        Self { cap, entries: Mutex::new(VecDeque::new()) }
    }

    /// Record an announcement, newest first; an existing entry for the same
    /// relay peer is replaced.
    pub fn note(&self, announcement: RelayAnnouncement) {
        let mut entries = self.entries.lock().expect("relay book mutex poisoned");
        entries.retain(|e| e.peer_id != announcement.peer_id);
        entries.push_front(announcement);
        entries.truncate(self.cap);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("relay book mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Circuit addresses for reaching `target` through known relays:
    /// `<relay-addr>/p2p-circuit/p2p/<target>`.
    pub fn circuit_addrs(&self, target: &PeerId) -> Vec<Multiaddr> {
        let entries = self.entries.lock().expect("relay book mutex poisoned");
        let mut out = Vec::new();
        for relay in entries.iter() {
            for addr in &relay.multiaddrs {
                if let Ok(base) = addr.parse::<Multiaddr>() {
                    let mut circuit = base;
                    circuit.push(Protocol::P2pCircuit);
                    circuit.push(Protocol::P2p(*target));
                    out.push(circuit);
                }
            }
        }
        out
    }
}
