use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sdn_auth::{AuthConfig, AuthCore, SessionStore, UserStore};
use sdn_core::{
    Cid, EventSink, NodeEvent, PeerId as CorePeerId, Pnm, RelayAnnouncement, SdnError,
    SubscriptionDispatcher, EPM_SCHEMA, IDENTITY_CID_NAMESPACE, PNM_SCHEMA,
};
use sdn_crypto::NodeSigner;
use sdn_exchange::{Envelope, ExchangeMessage, ExchangeService, MessageType};
use sdn_p2p::{
    ExchangeFetcher, NetworkEvent, P2pConfig, RelayBook, SdnNetwork, SwarmCommand,
};
use sdn_queue::{build_pnm, ContentFetcher, TipQueue, TipQueueConfig};
use sdn_schema::{JsonFields, SchemaRegistry, ValidationMode};
use sdn_store::{QueryOrder, Store};
use sdn_subscribe::SubscriptionManager;
use sdn_trust::{ConfigEntry, FailureTracker, TrustRegistry};

use crate::config::NodeConfig;

/// A running SDN node: owns every long-lived component and the background
/// tasks driving them.
pub struct Node {
    pub peer_id: CorePeerId,
    pub signer: Arc<NodeSigner>,
    pub registry: Arc<SchemaRegistry>,
    pub store: Arc<Store>,
    pub trust: Arc<TrustRegistry>,
    pub failures: Arc<FailureTracker>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub auth: Arc<AuthCore>,
    pub queue: Arc<TipQueue>,
    pub relays: Arc<RelayBook>,
    command_tx: mpsc::Sender<SwarmCommand>,
    events: Arc<dyn EventSink>,
    advertised_addr: String,
    pnm_topic: String,
    config: NodeConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bring the node up: storage, trust, auth, the tip queue, protocol
    /// services, the swarm, topic joins, and the identity advertisement.
    pub async fn start(
        config: NodeConfig,
        signer: NodeSigner,
        events: Arc<dyn EventSink>,
    ) -> anyhow::Result<Node> {
        let signer = Arc::new(signer);
        let peer_id = signer.peer_id();
        info!(peer = %peer_id, "starting SDN node");

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

        // ── Schema registry & content store ──────────────────────────────────
        let mode = if config.strict_validation {
            ValidationMode::Strict
        } else {
            ValidationMode::Lenient
        };
        let registry = Arc::new(SchemaRegistry::new(config.topic_prefix.clone(), mode));
        let store = Arc::new(
            Store::open(
                config.data_dir.join("records.db"),
                Arc::clone(&registry),
                Arc::new(JsonFields),
            )
            .context("opening content store")?,
        );

        // ── Trust registry (persists in the user-records DB file) ────────────
        let mut trust_config = HashMap::new();
        for entry in &config.trust {
            let Some(level) = sdn_core::TrustLevel::parse(&entry.level) else {
                warn!(peer = %entry.peer_id, level = %entry.level, "unknown trust level in config");
                continue;
            };
            trust_config.insert(
                CorePeerId::new(entry.peer_id.clone()),
                ConfigEntry { level, authoritative: entry.authoritative },
            );
        }
        let trust = Arc::new(
            TrustRegistry::open(
                config.data_dir.join("users.db"),
                trust_config,
                config.open_access,
            )
            .context("opening trust registry")?,
        );
        let failures = Arc::new(FailureTracker::new(
            config.quarantine_threshold,
            config.quarantine_cooldown_secs,
        ));

        // ── Auth core ────────────────────────────────────────────────────────
        let users =
            Arc::new(UserStore::open(config.data_dir.join("users.db")).context("opening user store")?);
        let sessions = Arc::new(
            SessionStore::open(config.data_dir.join("sessions.db"))
                .context("opening session store")?,
        );
        let auth = Arc::new(AuthCore::new(
            users,
            sessions,
            AuthConfig {
                session_ttl_secs: config.session_ttl_secs,
                max_pending_challenges: config.max_pending_challenges,
                ..Default::default()
            },
            Arc::clone(&events),
        ));

        // ── Subscriptions ────────────────────────────────────────────────────
        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::clone(&registry),
            Arc::new(JsonFields),
            Arc::clone(&events),
        ));
        let dispatcher: Arc<dyn SubscriptionDispatcher> = Arc::clone(&subscriptions) as _;

        // ── Protocol services ────────────────────────────────────────────────
        let exchange_service = Arc::new(
            ExchangeService::new(
                peer_id.clone(),
                Arc::clone(&store),
                Arc::clone(&registry),
                Arc::clone(&trust),
                Arc::clone(&failures),
                sdn_core::DEFAULT_MAX_RATE_LIMIT_ENTRIES,
                Some(Arc::clone(&dispatcher)),
                Arc::clone(&events),
            )
            .with_rate_limits(config.rate_overrides()),
        );
        let id_service = Arc::new(
            ExchangeService::new(
                peer_id.clone(),
                Arc::clone(&store),
                Arc::clone(&registry),
                Arc::clone(&trust),
                Arc::clone(&failures),
                sdn_core::DEFAULT_MAX_RATE_LIMIT_ENTRIES,
                Some(dispatcher.clone()),
                Arc::clone(&events),
            )
            .restricted_to(vec![PNM_SCHEMA.to_string(), EPM_SCHEMA.to_string()]),
        );

        // ── Swarm ────────────────────────────────────────────────────────────
        let mut topics: Vec<String> =
            registry.names().iter().map(|n| registry.topic(n)).collect();
        topics.push(registry.edge_relay_topic());
        let p2p_config = P2pConfig {
            listen_addrs: config.listen_addrs.clone(),
            bootstrap_peers: config.bootstrap_peers.clone(),
            topic_prefix: config.topic_prefix.clone(),
            protocol_version: format!("/{}/1.0.0", config.topic_prefix),
            topics,
            ..Default::default()
        };
        let (network, mut handle) = SdnNetwork::new(
            signer.libp2p_keypair(),
            p2p_config,
            exchange_service,
            id_service,
            Arc::clone(&trust),
        )
        .map_err(|e| anyhow::anyhow!("building P2P network: {e}"))?;
        let command_tx = handle.command_tx.clone();

        // ── Tip queue with the exchange-backed fetcher ───────────────────────
        let relays = Arc::new(RelayBook::new(64));
        let fetcher: Arc<dyn ContentFetcher> =
            Arc::new(ExchangeFetcher::new(command_tx.clone(), Arc::clone(&relays)));
        let queue = TipQueue::spawn(
            TipQueueConfig {
                max_queue_size: config.max_queue_size,
                fetch_concurrency: config.fetch_concurrency,
                max_fetch_attempts: config.max_fetch_attempts,
                grace_secs: config.tip_grace_secs,
            },
            config.policy.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            fetcher,
            Some(dispatcher),
            Arc::clone(&failures),
            Arc::clone(&events),
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(network.run()));

        // ── Inbound gossip / peer-event pump ─────────────────────────────────
        let pnm_topic = registry.pnm_topic();
        let relay_topic = registry.edge_relay_topic();
        {
            let queue = Arc::clone(&queue);
            let relays = Arc::clone(&relays);
            let events = Arc::clone(&events);
            let store = Arc::clone(&store);
            let signer = Arc::clone(&signer);
            let command_tx = command_tx.clone();
            let peer_id = peer_id.clone();
            let pnm_topic = pnm_topic.clone();
            let share_profile = config.share_profile_on_connect;
            tasks.push(tokio::spawn(async move {
                while let Some(event) = handle.event_rx.recv().await {
                    match event {
                        NetworkEvent::Gossip { topic, data, .. } => {
                            if topic == relay_topic {
                                match RelayAnnouncement::from_bytes(&data) {
                                    Ok(ad) => relays.note(ad),
                                    Err(e) => debug!(error = %e, "bad relay announcement"),
                                }
                            } else if topic == pnm_topic || topic.contains("/sds/") {
                                match Pnm::from_bytes(&data) {
                                    Ok(pnm) => queue.ingest(pnm),
                                    Err(e) => debug!(error = %e, topic = %topic, "bad PNM on gossip"),
                                }
                            }
                        }
                        NetworkEvent::PeerConnected { peer } => {
                            events.emit(NodeEvent::PeerConnected {
                                peer: CorePeerId::new(peer.to_string()),
                            });
                            if share_profile {
                                push_profile(&store, &signer, &peer_id, peer, &command_tx).await;
                            }
                        }
                        NetworkEvent::PeerDisconnected { peer } => {
                            events.emit(NodeEvent::PeerDisconnected {
                                peer: CorePeerId::new(peer.to_string()),
                            });
                        }
                    }
                }
            }));
        }

        // ── Periodic maintenance ─────────────────────────────────────────────
        let tip_gc_interval =
            Duration::from_secs((config.policy.system.ttl_secs / 10).clamp(1, 60));
        tasks.push(tokio::spawn(Arc::clone(&queue).run_gc(tip_gc_interval)));

        {
            let subscriptions = Arc::clone(&subscriptions);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    subscriptions.sweep();
                }
            }));
        }
        {
            let auth = Arc::clone(&auth);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(30));
                loop {
                    ticker.tick().await;
                    if let Err(e) = auth.sweep() {
                        warn!(error = %e, "auth sweep failed");
                    }
                }
            }));
        }
        {
            let store = Arc::clone(&store);
            let max_age = config.store_gc_max_age_secs;
            let min_keep = config.store_gc_min_keep;
            let interval = Duration::from_secs(config.store_gc_interval_secs.max(1));
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // skip the immediate first tick
                loop {
                    ticker.tick().await;
                    match store.gc(max_age, min_keep) {
                        Ok(evicted) if evicted > 0 => info!(evicted, "store gc evicted records"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "store gc failed"),
                    }
                }
            }));
        }

        // ── Identity advertisement on the DHT ────────────────────────────────
        // CID = SHA-256(namespace || public key), so clients holding only the
        // baked-in public key can find this node without an address.
        let identity_cid = identity_cid(&signer.public_key_bytes());
        if command_tx
            .send(SwarmCommand::StartProviding { key: identity_cid.to_vec() })
            .await
            .is_err()
        {
            warn!("could not advertise identity record");
        }

        let advertised_addr = config
            .advertised_addr
            .clone()
            .or_else(|| config.listen_addrs.first().cloned())
            .unwrap_or_default();
        let advertised_addr = format!("{advertised_addr}/p2p/{peer_id}");

        info!(peer = %peer_id, "node ready");
        Ok(Node {
            peer_id,
            signer,
            registry,
            store,
            trust,
            failures,
            subscriptions,
            auth,
            queue,
            relays,
            command_tx,
            events,
            advertised_addr,
            pnm_topic,
            config,
            tasks,
        })
    }

    /// Sign, store, and announce a locally produced record. Returns its CID.
    pub async fn publish(&self, schema: &str, payload: &[u8]) -> Result<Cid, SdnError> {
        let signature = self.signer.sign(payload);
        let outcome = self.store.put(schema, payload, &self.peer_id, &signature)?;
        if outcome.inserted {
            self.events.emit(NodeEvent::RecordStored {
                cid: outcome.cid,
                schema: schema.to_string(),
            });
        }

        let pnm = build_pnm(&self.signer, outcome.cid, schema, &self.advertised_addr, None);
        let data = pnm.to_bytes();
        for topic in [self.pnm_topic.clone(), self.registry.topic(schema)] {
            self.command_tx
                .send(SwarmCommand::PublishGossip { topic, data: data.clone() })
                .await
                .map_err(|_| SdnError::Shutdown)?;
        }
        Ok(outcome.cid)
    }

    /// Announce this node as an edge relay.
    pub async fn announce_relay(&self, multiaddrs: Vec<String>) -> Result<(), SdnError> {
        let announcement = RelayAnnouncement {
            peer_id: self.peer_id.clone(),
            multiaddrs,
            published_at: chrono::Utc::now().timestamp(),
        };
        self.command_tx
            .send(SwarmCommand::PublishGossip {
                topic: self.registry.edge_relay_topic(),
                data: announcement.to_bytes(),
            })
            .await
            .map_err(|_| SdnError::Shutdown)
    }

    /// Push our EPM profile to a peer over the ID Exchange protocol.
    pub async fn send_profile(&self, peer: libp2p::PeerId) -> Result<(), SdnError> {
        push_profile(&self.store, &self.signer, &self.peer_id, peer, &self.command_tx).await;
        Ok(())
    }

    /// Stop the node: the tip queue stops accepting work, then background
    /// tasks get a bounded grace window before being abandoned.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.queue.shutdown();
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        drop(self.command_tx);

        let aborts: Vec<_> = self.tasks.iter().map(|t| t.abort_handle()).collect();
        if tokio::time::timeout(grace, futures::future::join_all(self.tasks)).await.is_err() {
            warn!("shutdown grace expired; abandoning in-flight work");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("node stopped");
    }
}

/// Identity CID bytes: SHA-256 over the namespace string and the node's raw
/// public key.
pub fn identity_cid(public_key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(IDENTITY_CID_NAMESPACE.as_bytes());
    hasher.update(public_key);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Locate our most recent EPM record and push it over the ID Exchange.
async fn push_profile(
    store: &Arc<Store>,
    signer: &Arc<NodeSigner>,
    local: &CorePeerId,
    peer: libp2p::PeerId,
    command_tx: &mpsc::Sender<SwarmCommand>,
) {
    let profile = match store.query(EPM_SCHEMA, &[], None, QueryOrder::ReceivedDesc) {
        Ok(records) => records.into_iter().find(|r| &r.producer == local),
        Err(e) => {
            debug!(error = %e, "profile lookup failed");
            return;
        }
    };
    let Some(profile) = profile else { return };

    let mut wire = profile.payload.clone();
    wire.extend_from_slice(&signer.sign(&profile.payload));
    let envelope =
        Envelope::plain(ExchangeMessage::new(MessageType::PushData, EPM_SCHEMA, wire));

    let (reply_tx, reply_rx) = oneshot::channel();
    if command_tx
        .send(SwarmCommand::SendIdExchange {
            peer,
            addresses: Vec::new(),
            envelope,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return;
    }
    match reply_rx.await {
        Ok(Ok(response)) if response.message.msg_type == MessageType::Ack => {
            debug!(peer = %peer, "profile delivered");
        }
        Ok(Ok(response)) => {
            debug!(peer = %peer, reply = ?response.message.msg_type, "profile push refused");
        }
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "profile push failed"),
        Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_cid_is_stable_and_key_dependent() {
        let a = identity_cid(&[1u8; 32]);
        let b = identity_cid(&[1u8; 32]);
        let c = identity_cid(&[2u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        // Matches a direct hash of namespace || key.
        let mut hasher = Sha256::new();
        hasher.update(IDENTITY_CID_NAMESPACE.as_bytes());
        hasher.update([1u8; 32]);
        assert_eq!(a.as_slice(), hasher.finalize().as_slice());
    }
}
