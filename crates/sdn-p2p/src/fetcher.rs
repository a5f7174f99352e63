use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::Multiaddr;
use tokio::sync::{mpsc, oneshot};

use sdn_core::{Cid, PeerId, SdnError};
use sdn_exchange::{Envelope, ExchangeMessage, MessageType};
use sdn_queue::{ContentFetcher, FetchedRecord};

use crate::network::SwarmCommand;
use crate::relay::RelayBook;

/// `ContentFetcher` that drives the SDS Exchange protocol over the swarm:
/// dial the producer at its announced address (falling back to circuit
/// relays), issue `RequestData(cid)`, and peel the trailing signature off
/// the response.
pub struct ExchangeFetcher {
    command_tx: mpsc::Sender<SwarmCommand>,
    relays: Arc<RelayBook>,
}

impl ExchangeFetcher {
    pub fn new(command_tx: mpsc::Sender<SwarmCommand>, relays: Arc<RelayBook>) -> Self {
        Self { command_tx, relays }
    }
}

#[async_trait]
impl ContentFetcher for ExchangeFetcher {
    async fn fetch(
        &self,
        producer: &PeerId,
        multiaddr: &str,
        cid: &Cid,
        schema: &str,
        _timeout: Duration,
    ) -> Result<FetchedRecord, SdnError> {
        let peer: libp2p::PeerId = producer
            .as_str()
            .parse()
            .map_err(|_| SdnError::InvalidRequest("unparseable producer peer id".into()))?;

        let mut addresses: Vec<Multiaddr> = Vec::new();
        if let Ok(addr) = multiaddr.parse::<Multiaddr>() {
            addresses.push(addr);
        }
        addresses.extend(self.relays.circuit_addrs(&peer));

        let envelope = Envelope::plain(ExchangeMessage::new(
            MessageType::RequestData,
            schema,
            cid.to_hex().into_bytes(),
        ));

        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SwarmCommand::SendExchange { peer, addresses, envelope, reply: reply_tx })
            .await
            .map_err(|_| SdnError::Shutdown)?;
        let response = reply_rx
            .await
            .map_err(|_| SdnError::TransportError("swarm task dropped request".into()))??;

        match response.message.msg_type {
            MessageType::Response => {
                let body = response.message.payload;
                if body.len() < 64 {
                    return Err(SdnError::InvalidRequest("response shorter than signature".into()));
                }
                let split = body.len() - 64;
                Ok(FetchedRecord {
                    payload: body[..split].to_vec(),
                    signature: body[split..].to_vec(),
                })
            }
            MessageType::Nack => {
                let reason = String::from_utf8_lossy(&response.message.payload).to_string();
                Err(match reason.as_str() {
                    "not_found" => SdnError::NotFound,
                    "rate_limited" => SdnError::RateLimited,
                    "quarantined" => SdnError::Quarantined,
                    other => SdnError::TransportError(format!("nack: {other}")),
                })
            }
            _ => Err(SdnError::InvalidRequest("unexpected response type".into())),
        }
    }
}
