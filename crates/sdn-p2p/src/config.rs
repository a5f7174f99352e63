use sdn_core::{
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_CONNECTIONS_PER_PEER, DEFAULT_STREAM_IDLE_SECS,
    DEFAULT_TOPIC_PREFIX,
};

/// Configuration for the SDN transport layer.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Local listen addresses (e.g. "/ip4/0.0.0.0/tcp/4001").
    pub listen_addrs: Vec<String>,
    /// Bootstrap peer multiaddresses (must end in /p2p/<peer-id>).
    pub bootstrap_peers: Vec<String>,
    /// Topic and protocol-id prefix.
    pub topic_prefix: String,
    /// Protocol version advertised through identify.
    pub protocol_version: String,
    /// Gossip topics to join at startup (one per schema, plus PNM and
    /// edge-relays).
    pub topics: Vec<String>,
    /// Stream request timeout (also the idle cutoff for exchange streams).
    pub stream_timeout_secs: u64,
    pub max_connections: u32,
    pub max_connections_per_peer: u32,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec!["/ip4/0.0.0.0/tcp/4001".into()],
            bootstrap_peers: Vec::new(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.into(),
            protocol_version: format!("/{DEFAULT_TOPIC_PREFIX}/1.0.0"),
            topics: Vec::new(),
            stream_timeout_secs: DEFAULT_STREAM_IDLE_SECS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_per_peer: DEFAULT_MAX_CONNECTIONS_PER_PEER,
        }
    }
}
