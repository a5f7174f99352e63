use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    gossipsub, identify, kad,
    kad::RecordKey,
    noise, ping,
    request_response::{self, ProtocolSupport, ResponseChannel},
    swarm::SwarmEvent,
    tcp, yamux, Multiaddr, PeerId, Swarm,
};
use libp2p_swarm::NetworkBehaviour;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use sdn_core::SdnError;
use sdn_exchange::{exchange_protocol, id_exchange_protocol, Envelope, ExchangeService, SdsCodec};
use sdn_trust::TrustRegistry;

use crate::config::P2pConfig;

/// Combined libp2p network behaviour for an SDN node.
///
/// The `#[derive(NetworkBehaviour)]` macro auto-generates an
/// `SdnBehaviourEvent` enum with one variant per field.
#[derive(NetworkBehaviour)]
pub struct SdnBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    /// `/<prefix>/sds-exchange/1.0.0` — record request/push/query.
    pub exchange: request_response::Behaviour<SdsCodec>,
    /// `/<prefix>/id-exchange/1.0.0` — PNM/EPM handshake.
    pub id_exchange: request_response::Behaviour<SdsCodec>,
}

/// Instructions for the swarm task.
pub enum SwarmCommand {
    PublishGossip {
        topic: String,
        data: Vec<u8>,
    },
    /// Send one exchange request and reply on the oneshot with the response.
    SendExchange {
        peer: PeerId,
        addresses: Vec<Multiaddr>,
        envelope: Envelope,
        reply: oneshot::Sender<Result<Envelope, SdnError>>,
    },
    SendIdExchange {
        peer: PeerId,
        addresses: Vec<Multiaddr>,
        envelope: Envelope,
        reply: oneshot::Sender<Result<Envelope, SdnError>>,
    },
    Dial {
        addr: Multiaddr,
    },
    /// Advertise a provider record on the DHT (identity CID discovery).
    StartProviding {
        key: Vec<u8>,
    },
}

/// What the swarm task reports back to the node.
#[derive(Debug)]
pub enum NetworkEvent {
    Gossip { topic: String, data: Vec<u8>, source: Option<PeerId> },
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
}

/// Application-facing handle returned from `SdnNetwork::new()`.
pub struct P2pHandle {
    pub command_tx: mpsc::Sender<SwarmCommand>,
    pub event_rx: mpsc::Receiver<NetworkEvent>,
    pub local_peer_id: PeerId,
}

/// Owns the libp2p Swarm. Pass to `tokio::spawn(network.run())`.
pub struct SdnNetwork {
    swarm: Swarm<SdnBehaviour>,
    config: P2pConfig,
    command_rx: mpsc::Receiver<SwarmCommand>,
    event_tx: mpsc::Sender<NetworkEvent>,
    exchange_service: Arc<ExchangeService>,
    id_service: Arc<ExchangeService>,
    trust: Arc<TrustRegistry>,
    /// Topic hash → topic name, for demultiplexing inbound gossip.
    topic_names: HashMap<gossipsub::TopicHash, String>,
    pending_exchange: HashMap<request_response::OutboundRequestId, oneshot::Sender<Result<Envelope, SdnError>>>,
    pending_id: HashMap<request_response::OutboundRequestId, oneshot::Sender<Result<Envelope, SdnError>>>,
}

impl SdnNetwork {
    /// Build the network and return `(SdnNetwork, P2pHandle)`.
    pub fn new(
        keypair: libp2p::identity::Keypair,
        config: P2pConfig,
        exchange_service: Arc<ExchangeService>,
        id_service: Arc<ExchangeService>,
        trust: Arc<TrustRegistry>,
    ) -> Result<(Self, P2pHandle), Box<dyn std::error::Error + Send + Sync>> {
        let stream_timeout = Duration::from_secs(config.stream_timeout_secs);
        let prefix = config.topic_prefix.clone();

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key: &libp2p::identity::Keypair| {
                let message_id_fn = |msg: &gossipsub::Message| {
                    let mut s = DefaultHasher::new();
                    msg.data.hash(&mut s);
                    gossipsub::MessageId::from(s.finish().to_string())
                };

                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .message_id_fn(message_id_fn)
                    .build()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

                let store = kad::store::MemoryStore::new(key.public().to_peer_id());
                let kademlia = kad::Behaviour::new(key.public().to_peer_id(), store);

                let identify = identify::Behaviour::new(identify::Config::new(
                    config.protocol_version.clone(),
                    key.public(),
                ));

                let ping = ping::Behaviour::default();

                let rr_config = request_response::Config::default()
                    .with_request_timeout(stream_timeout);
                let exchange = request_response::Behaviour::with_codec(
                    SdsCodec,
                    [(exchange_protocol(&prefix), ProtocolSupport::Full)],
                    rr_config.clone(),
                );
                let id_exchange = request_response::Behaviour::with_codec(
                    SdsCodec,
                    [(id_exchange_protocol(&prefix), ProtocolSupport::Full)],
                    rr_config,
                );

                Ok(SdnBehaviour { gossipsub, kademlia, identify, ping, exchange, id_exchange })
            })?
            .with_swarm_config(|c| c.with_idle_connection_timeout(stream_timeout))
            .build();

        let mut topic_names = HashMap::new();
        for name in &config.topics {
            let topic = gossipsub::IdentTopic::new(name.clone());
            swarm.behaviour_mut().gossipsub.subscribe(&topic)?;
            topic_names.insert(topic.hash(), name.clone());
        }

        for addr_str in &config.listen_addrs {
            let listen_addr: Multiaddr = addr_str.parse()?;
            swarm.listen_on(listen_addr)?;
        }

        for addr_str in &config.bootstrap_peers {
            if let Ok(addr) = addr_str.parse::<Multiaddr>() {
                if let Some(libp2p::multiaddr::Protocol::P2p(peer_id)) = addr.iter().last() {
                    swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                    debug!(peer = %peer_id, "added bootstrap peer");
                }
            }
        }

        let local_peer_id = *swarm.local_peer_id();
        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);

        let network = SdnNetwork {
            swarm,
            config,
            command_rx,
            event_tx,
            exchange_service,
            id_service,
            trust,
            topic_names,
            pending_exchange: HashMap::new(),
            pending_id: HashMap::new(),
        };
        let handle = P2pHandle { command_tx, event_rx, local_peer_id };

        Ok((network, handle))
    }

    /// Drive the swarm event loop. Run in a dedicated tokio task; exits when
    /// the command channel closes.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_command = self.command_rx.recv() => match maybe_command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("command channel closed; swarm task exiting");
                        break;
                    }
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event).await,
            }
        }
    }

    fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::PublishGossip { topic, data } => {
                let topic = gossipsub::IdentTopic::new(topic);
                if let Err(e) = self.swarm.behaviour_mut().gossipsub.publish(topic, data) {
                    warn!(error = %e, "gossipsub publish failed");
                }
            }
            SwarmCommand::SendExchange { peer, addresses, envelope, reply } => {
                for addr in addresses {
                    self.swarm.add_peer_address(peer, addr);
                }
                let id = self.swarm.behaviour_mut().exchange.send_request(&peer, envelope);
                self.pending_exchange.insert(id, reply);
            }
            SwarmCommand::SendIdExchange { peer, addresses, envelope, reply } => {
                for addr in addresses {
                    self.swarm.add_peer_address(peer, addr);
                }
                let id = self.swarm.behaviour_mut().id_exchange.send_request(&peer, envelope);
                self.pending_id.insert(id, reply);
            }
            SwarmCommand::Dial { addr } => {
                if let Err(e) = self.swarm.dial(addr) {
                    warn!(error = %e, "dial failed");
                }
            }
            SwarmCommand::StartProviding { key } => {
                if let Err(e) =
                    self.swarm.behaviour_mut().kademlia.start_providing(RecordKey::new(&key))
                {
                    warn!(error = %e, "failed to start providing identity record");
                }
            }
        }
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<SdnBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "P2P listening on");
            }
            SwarmEvent::Behaviour(SdnBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                message,
                ..
            })) => {
                let Some(topic) = self.topic_names.get(&message.topic).cloned() else {
                    debug!(topic = %message.topic, "gossip on unjoined topic ignored");
                    return;
                };
                let _ = self
                    .event_tx
                    .send(NetworkEvent::Gossip { topic, data: message.data, source: message.source })
                    .await;
            }
            SwarmEvent::Behaviour(SdnBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(SdnBehaviourEvent::Exchange(event)) => {
                self.handle_request_response(event, true);
            }
            SwarmEvent::Behaviour(SdnBehaviourEvent::IdExchange(event)) => {
                self.handle_request_response(event, false);
            }
            SwarmEvent::ConnectionEstablished { peer_id, num_established, .. } => {
                let core_peer = sdn_core::PeerId::new(peer_id.to_string());
                if !self.trust.gate_dial(&core_peer) {
                    debug!(peer = %peer_id, "connection denied by trust gate");
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                    return;
                }
                let total = self.swarm.network_info().connection_counters().num_established();
                if total > self.config.max_connections {
                    warn!(peer = %peer_id, total, "connection limit reached; disconnecting");
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                    return;
                }
                if u32::from(num_established) > self.config.max_connections_per_peer {
                    debug!(peer = %peer_id, "per-peer connection limit reached; disconnecting");
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                    return;
                }
                if u32::from(num_established) == 1 {
                    debug!(peer = %peer_id, "connection established");
                    let _ =
                        self.event_tx.send(NetworkEvent::PeerConnected { peer: peer_id }).await;
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                debug!(peer = %peer_id, "connection closed");
                if num_established == 0 {
                    let _ =
                        self.event_tx.send(NetworkEvent::PeerDisconnected { peer: peer_id }).await;
                }
            }
            _ => {}
        }
    }

    /// Shared handling for both exchange protocols: answer inbound requests
    /// through the service, resolve pending oneshots for responses, relay
    /// routed copies.
    fn handle_request_response(
        &mut self,
        event: request_response::Event<Envelope, Envelope>,
        is_exchange: bool,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    let service =
                        if is_exchange { &self.exchange_service } else { &self.id_service };
                    let core_peer = sdn_core::PeerId::new(peer.to_string());
                    let outcome = service.handle(&core_peer, request);
                    self.respond(channel, outcome.response, is_exchange);
                    for (dest, envelope) in outcome.forwards {
                        if let Ok(dest_peer) = dest.as_str().parse::<PeerId>() {
                            let behaviour = self.swarm.behaviour_mut();
                            let rr = if is_exchange {
                                &mut behaviour.exchange
                            } else {
                                &mut behaviour.id_exchange
                            };
                            // Fire-and-forget relay; failures surface as
                            // OutboundFailure with no pending waiter.
                            let _ = rr.send_request(&dest_peer, envelope);
                        }
                    }
                }
                request_response::Message::Response { request_id, response } => {
                    let pending =
                        if is_exchange { &mut self.pending_exchange } else { &mut self.pending_id };
                    if let Some(reply) = pending.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure { request_id, error, .. } => {
                let pending =
                    if is_exchange { &mut self.pending_exchange } else { &mut self.pending_id };
                if let Some(reply) = pending.remove(&request_id) {
                    let _ = reply.send(Err(SdnError::TransportError(error.to_string())));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(peer = %peer, error = %error, "inbound exchange stream failed");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn respond(&mut self, channel: ResponseChannel<Envelope>, envelope: Envelope, is_exchange: bool) {
        let behaviour = self.swarm.behaviour_mut();
        let result = if is_exchange {
            behaviour.exchange.send_response(channel, envelope)
        } else {
            behaviour.id_exchange.send_response(channel, envelope)
        };
        if result.is_err() {
            debug!("response dropped; stream already closed");
        }
    }
}
