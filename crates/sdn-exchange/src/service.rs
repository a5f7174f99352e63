use std::sync::Arc;

use tracing::{debug, warn};

use sdn_core::{
    Cid, EventSink, NodeEvent, PeerId, Record, SdnError, SubscriptionDispatcher, TrustLevel,
    PUSH_SIGNATURE_LEN,
};
use sdn_schema::SchemaRegistry;
use sdn_store::{QueryOrder, Store};
use sdn_trust::{default_limits, FailureTracker, RateTable, TrustRegistry};

use crate::message::{
    encode_record_list, Envelope, ExchangeMessage, MessageType, QueryRequest, RoutingHeader,
};

/// What the stream handler should do with an inbound request: reply, and
/// possibly relay copies toward destinations named in the routing header.
#[derive(Debug)]
pub struct HandleOutcome {
    pub response: Envelope,
    pub forwards: Vec<(PeerId, Envelope)>,
}

impl HandleOutcome {
    fn reply(message: ExchangeMessage) -> Self {
        Self { response: Envelope::plain(message), forwards: Vec::new() }
    }
}

/// Server side of the SDS Exchange protocol.
///
/// Pure request → response logic: the swarm layer feeds inbound envelopes in
/// and ships the outcome back onto the stream, which keeps every branch
/// testable without a network.
pub struct ExchangeService {
    local_peer: PeerId,
    store: Arc<Store>,
    registry: Arc<SchemaRegistry>,
    trust: Arc<TrustRegistry>,
    failures: Arc<FailureTracker>,
    requests: RateTable,
    dispatcher: Option<Arc<dyn SubscriptionDispatcher>>,
    events: Arc<dyn EventSink>,
    /// When set, only these schemas are served (the ID Exchange protocol is
    /// restricted to PNM and EPM).
    allowed_schemas: Option<Vec<String>>,
    /// Operator overrides of the per-trust request quota.
    rate_overrides: std::collections::HashMap<TrustLevel, u32>,
}

impl ExchangeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        store: Arc<Store>,
        registry: Arc<SchemaRegistry>,
        trust: Arc<TrustRegistry>,
        failures: Arc<FailureTracker>,
        max_rate_entries: usize,
        dispatcher: Option<Arc<dyn SubscriptionDispatcher>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            local_peer,
            store,
            registry,
            trust,
            failures,
            requests: RateTable::new(max_rate_entries),
            dispatcher,
            events,
            allowed_schemas: None,
            rate_overrides: std::collections::HashMap::new(),
        }
    }

    /// Restrict the service to a schema subset (ID Exchange).
    pub fn restricted_to(mut self, schemas: Vec<String>) -> Self {
        self.allowed_schemas = Some(schemas);
        self
    }

    /// Override the per-minute request quota for specific trust levels.
    pub fn with_rate_limits(
        mut self,
        overrides: std::collections::HashMap<TrustLevel, u32>,
    ) -> Self {
        self.rate_overrides = overrides;
        self
    }

    fn limits_for(&self, level: TrustLevel) -> sdn_trust::TrustLimits {
        let mut limits = default_limits(level);
        if let Some(per_min) = self.rate_overrides.get(&level) {
            limits.requests_per_min = *per_min;
        }
        limits
    }

    /// Handle one inbound request envelope from `from`.
    pub fn handle(&self, from: &PeerId, envelope: Envelope) -> HandleOutcome {
        let schema = envelope.message.schema_name.clone();

        if self.failures.is_quarantined(from) {
            return HandleOutcome::reply(ExchangeMessage::nack(&schema, "quarantined"));
        }

        let limits = self.limits_for(self.trust.level(from));
        if self.requests.check(from.as_str(), limits.requests_per_min).is_err() {
            self.events.emit(NodeEvent::RateLimited { scope: format!("exchange:{from}") });
            return HandleOutcome::reply(ExchangeMessage::nack(&schema, "rate_limited"));
        }

        if let Some(allowed) = &self.allowed_schemas {
            if !allowed.iter().any(|s| s == &schema) {
                return HandleOutcome::reply(ExchangeMessage::nack(&schema, "forbidden_schema"));
            }
        }

        match &envelope.routing {
            Some(routing) => self.handle_routed(from, routing.clone(), envelope.message),
            None => HandleOutcome::reply(self.handle_local(from, &envelope.message, false)),
        }
    }

    /// Destination-addressed message: process locally when we are addressed,
    /// relay the rest while the hop budget lasts.
    fn handle_routed(
        &self,
        from: &PeerId,
        routing: RoutingHeader,
        message: ExchangeMessage,
    ) -> HandleOutcome {
        let addressed_to_me = routing.destination_peers.is_empty()
            || routing.destination_peers.contains(&self.local_peer);

        let mut forwards = Vec::new();
        if routing.ttl > 0 {
            let remaining: Vec<PeerId> = routing
                .destination_peers
                .iter()
                .filter(|p| **p != self.local_peer && *p != from)
                .cloned()
                .collect();
            if !remaining.is_empty() {
                let next = RoutingHeader { ttl: routing.ttl - 1, ..routing.clone() };
                for dest in remaining {
                    forwards.push((
                        dest,
                        Envelope { routing: Some(next.clone()), message: message.clone() },
                    ));
                }
            }
        }

        let response = if addressed_to_me {
            self.handle_local(from, &message, routing.encrypted)
        } else if forwards.is_empty() {
            ExchangeMessage::nack(&message.schema_name, "ttl_expired")
        } else {
            ExchangeMessage::ack(&message.schema_name, "relayed".into())
        };

        HandleOutcome { response: Envelope::plain(response), forwards }
    }

    fn handle_local(
        &self,
        from: &PeerId,
        message: &ExchangeMessage,
        encrypted: bool,
    ) -> ExchangeMessage {
        match message.msg_type {
            MessageType::RequestData => self.handle_request_data(from, message),
            MessageType::PushData => self.handle_push(from, message, encrypted),
            MessageType::Query => self.handle_query(from, message),
            MessageType::Response | MessageType::Ack | MessageType::Nack => {
                ExchangeMessage::nack(&message.schema_name, "invalid_request")
            }
        }
    }

    fn handle_request_data(&self, from: &PeerId, message: &ExchangeMessage) -> ExchangeMessage {
        let cid_text = match std::str::from_utf8(&message.payload) {
            Ok(s) => s,
            Err(_) => return ExchangeMessage::nack(&message.schema_name, "invalid_request"),
        };
        let cid = match Cid::from_hex(cid_text) {
            Ok(c) => c,
            Err(_) => return ExchangeMessage::nack(&message.schema_name, "invalid_request"),
        };
        match self.store.get(&cid) {
            Ok(record) => {
                let limits = self.limits_for(self.trust.level(from));
                let mut payload = record.payload;
                payload.extend_from_slice(&record.signature);
                if payload.len() > limits.max_response_bytes {
                    return ExchangeMessage::nack(&record.schema_name, "response_too_large");
                }
                ExchangeMessage::new(MessageType::Response, record.schema_name, payload)
            }
            Err(SdnError::NotFound) => ExchangeMessage::nack(&message.schema_name, "not_found"),
            Err(e) => {
                warn!(error = %e, cid = %cid, "record lookup failed");
                ExchangeMessage::nack(&message.schema_name, e.code())
            }
        }
    }

    fn handle_push(
        &self,
        from: &PeerId,
        message: &ExchangeMessage,
        encrypted: bool,
    ) -> ExchangeMessage {
        let schema = &message.schema_name;
        if message.payload.len() < PUSH_SIGNATURE_LEN {
            self.note_failure(from);
            return ExchangeMessage::nack(schema, "invalid_request");
        }
        let (payload, signature) =
            message.payload.split_at(message.payload.len() - PUSH_SIGNATURE_LEN);

        if encrypted {
            // End-to-end encrypted payloads cannot be schema-validated or
            // pinned here; verify the sender and hand the ciphertext to
            // matching subscriptions only.
            if sdn_crypto::verify_from_peer(from, payload, signature).is_err() {
                self.note_failure(from);
                return ExchangeMessage::nack(schema, "invalid_signature");
            }
            self.failures.record_success(from);
            let record = Record {
                schema_name: schema.clone(),
                payload: payload.to_vec(),
                signature: signature.to_vec(),
                producer: from.clone(),
                received_at: chrono::Utc::now().timestamp(),
            };
            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.dispatch(&record, from, true);
            }
            return ExchangeMessage::ack(schema, record.cid().to_hex());
        }

        match self.store.put(schema, payload, from, signature) {
            Ok(outcome) => {
                self.failures.record_success(from);
                if outcome.inserted {
                    self.events.emit(NodeEvent::RecordStored {
                        cid: outcome.cid,
                        schema: schema.clone(),
                    });
                    if let Some(dispatcher) = &self.dispatcher {
                        let record = Record {
                            schema_name: schema.clone(),
                            payload: payload.to_vec(),
                            signature: signature.to_vec(),
                            producer: from.clone(),
                            received_at: chrono::Utc::now().timestamp(),
                        };
                        dispatcher.dispatch(&record, from, false);
                    }
                }
                ExchangeMessage::ack(schema, outcome.cid.to_hex())
            }
            Err(e @ (SdnError::InvalidSignature | SdnError::SchemaValidationFailed(_))) => {
                self.note_failure(from);
                debug!(peer = %from, error = %e, "push rejected");
                ExchangeMessage::nack(schema, e.code())
            }
            Err(e) => {
                warn!(peer = %from, error = %e, "push failed");
                ExchangeMessage::nack(schema, e.code())
            }
        }
    }

    fn handle_query(&self, from: &PeerId, message: &ExchangeMessage) -> ExchangeMessage {
        if self.trust.level(from) < TrustLevel::Standard {
            return ExchangeMessage::nack(&message.schema_name, "forbidden");
        }
        let request = match QueryRequest::from_bytes(&message.payload) {
            Ok(r) => r,
            Err(_) => return ExchangeMessage::nack(&message.schema_name, "invalid_request"),
        };
        if !self.registry.has(&request.schema) {
            return ExchangeMessage::nack(&request.schema, "unknown_schema");
        }
        let records = match self.store.query(
            &request.schema,
            &request.predicates,
            request.limit.map(|l| l as usize),
            QueryOrder::Insertion,
        ) {
            Ok(r) => r,
            Err(e) => return ExchangeMessage::nack(&request.schema, e.code()),
        };

        let limits = self.limits_for(self.trust.level(from));
        let mut items = Vec::new();
        let mut total = 0usize;
        for record in records {
            let mut item = record.payload;
            item.extend_from_slice(&record.signature);
            total += item.len() + 8;
            if total > limits.max_response_bytes {
                break;
            }
            items.push(item);
        }
        ExchangeMessage::new(MessageType::Response, request.schema, encode_record_list(&items))
    }

    fn note_failure(&self, from: &PeerId) {
        if self.failures.record_failure(from) {
            warn!(peer = %from, "peer quarantined after repeated protocol failures");
        }
    }
}
