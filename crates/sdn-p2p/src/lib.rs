//! sdn-p2p
//!
//! libp2p transport layer for SDN nodes.
//!
//! GossipSub carries PNM announcements and relay advertisements; Kademlia
//! handles discovery and identity-CID provider records; two request-response
//! protocols carry the SDS Exchange and the PNM/EPM handshake; identify and
//! ping maintain connection metadata and liveness.

pub mod config;
pub mod fetcher;
pub mod network;
pub mod relay;

pub use config::P2pConfig;
pub use fetcher::ExchangeFetcher;
pub use network::{NetworkEvent, P2pHandle, SdnBehaviour, SdnNetwork, SwarmCommand};
pub use relay::RelayBook;
