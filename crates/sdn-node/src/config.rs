use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use sdn_core::{PolicyConfig, TrustLevel, DEFAULT_TOPIC_PREFIX};

/// One configured trust entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEntryConfig {
    pub peer_id: String,
    pub level: String,
    #[serde(default)]
    pub authoritative: bool,
}

/// Everything the node reads from configuration. Field defaults keep a bare
/// `{}` config file valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub listen_addrs: Vec<String>,
    pub bootstrap_peers: Vec<String>,
    pub topic_prefix: String,
    /// Dialable address advertised inside PNMs. Defaults to the first
    /// listen address.
    pub advertised_addr: Option<String>,
    /// Publicly reachable listener configured for open access: the dial
    /// gate admits unknown peers.
    pub open_access: bool,
    pub strict_validation: bool,
    /// Push our EPM profile over the ID Exchange when a peer connects.
    pub share_profile_on_connect: bool,

    // Tip queue
    pub max_queue_size: usize,
    pub fetch_concurrency: usize,
    pub max_fetch_attempts: u32,
    pub tip_grace_secs: u64,

    // Store GC
    pub store_gc_max_age_secs: u64,
    pub store_gc_min_keep: usize,
    pub store_gc_interval_secs: u64,

    // Policy hierarchy
    pub policy: PolicyConfig,

    // Trust
    pub trust: Vec<TrustEntryConfig>,
    /// Per-trust-level request quota overrides (level name → requests/min).
    pub rate_limits: HashMap<String, u32>,
    pub quarantine_threshold: u32,
    pub quarantine_cooldown_secs: u64,

    // Auth
    pub session_ttl_secs: i64,
    pub max_pending_challenges: usize,

    // Subscription defaults
    pub default_batch_size: usize,
    pub default_batch_interval_secs: u64,

    pub shutdown_grace_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.sdn/data"),
            listen_addrs: vec!["/ip4/0.0.0.0/tcp/4001".into()],
            bootstrap_peers: Vec::new(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.into(),
            advertised_addr: None,
            open_access: true,
            strict_validation: true,
            share_profile_on_connect: false,
            max_queue_size: sdn_core::DEFAULT_MAX_QUEUE_SIZE,
            fetch_concurrency: sdn_core::DEFAULT_FETCH_CONCURRENCY,
            max_fetch_attempts: sdn_core::DEFAULT_MAX_FETCH_ATTEMPTS,
            tip_grace_secs: sdn_core::DEFAULT_TIP_GRACE_SECS,
            store_gc_max_age_secs: 30 * 24 * 3600,
            store_gc_min_keep: 100,
            store_gc_interval_secs: 3600,
            policy: PolicyConfig::default(),
            trust: Vec::new(),
            rate_limits: HashMap::new(),
            quarantine_threshold: sdn_core::DEFAULT_QUARANTINE_THRESHOLD,
            quarantine_cooldown_secs: sdn_core::DEFAULT_QUARANTINE_COOLDOWN_SECS,
            session_ttl_secs: sdn_core::DEFAULT_SESSION_TTL_SECS,
            max_pending_challenges: sdn_core::DEFAULT_MAX_PENDING_CHALLENGES,
            default_batch_size: sdn_core::DEFAULT_BATCH_SIZE,
            default_batch_interval_secs: sdn_core::DEFAULT_BATCH_INTERVAL_SECS,
            shutdown_grace_secs: sdn_core::DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

impl NodeConfig {
    /// Parsed trust-level rate overrides keyed by level.
    pub fn rate_overrides(&self) -> HashMap<TrustLevel, u32> {
        self.rate_limits
            .iter()
            .filter_map(|(name, per_min)| TrustLevel::parse(name).map(|l| (l, *per_min)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_a_valid_config() {
        let config: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.topic_prefix, DEFAULT_TOPIC_PREFIX);
        assert!(config.strict_validation);
    }

    #[test]
    fn rate_overrides_parse_level_names() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"rate_limits": {"standard": 50, "bogus": 1, "Trusted": 900}}"#,
        )
        .unwrap();
        let overrides = config.rate_overrides();
        assert_eq!(overrides.get(&TrustLevel::Standard), Some(&50));
        assert_eq!(overrides.get(&TrustLevel::Trusted), Some(&900));
        assert_eq!(overrides.len(), 2, "unknown level names are ignored");
    }
}
