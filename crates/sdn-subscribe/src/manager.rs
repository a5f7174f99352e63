use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sdn_core::{
    EventSink, NodeEvent, PeerId, Predicate, Record, SdnError, SubscriptionDispatcher,
    DEFAULT_BATCH_BUFFER_CAP,
};
use sdn_schema::{PayloadFields, SchemaRegistry};
use sdn_trust::TokenBucket;

/// Wildcard accepted in `schemas` and `source_peers`.
pub const WILDCARD: &str = "all";

/// Delivery behavior of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionMode {
    /// Deliver the first match, then auto-remove.
    Single,
    /// Deliver every match until removed.
    Streaming,
    /// Accumulate matches; deliver atomically at `batch_size` or when
    /// `batch_interval_secs` elapses.
    Batch { batch_size: usize, batch_interval_secs: u64 },
}

/// Whether a subscription accepts plaintext, end-to-end encrypted records, or
/// both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMode {
    PlaintextOnly,
    EncryptedOnly,
    Either,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Error,
}

/// Client-supplied subscription parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Schema names, or the wildcard "all".
    pub schemas: Vec<String>,
    /// Producer peer ids, or the wildcard "all".
    pub source_peers: Vec<String>,
    pub filters: Vec<Predicate>,
    pub mode: SubscriptionMode,
    pub encryption: EncryptionMode,
    /// Messages per minute; `None` = unlimited.
    pub rate_limit_per_min: Option<u32>,
    /// Subscription lifetime; `None` = until removed.
    pub ttl_secs: Option<u64>,
    /// Owning client session. Streaming subscriptions clear when it ends.
    pub session: Option<String>,
}

/// Partial update applied by `update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPatch {
    pub schemas: Option<Vec<String>>,
    pub source_peers: Option<Vec<String>>,
    pub filters: Option<Vec<Predicate>>,
    pub encryption: Option<EncryptionMode>,
    pub rate_limit_per_min: Option<Option<u32>>,
    pub ttl_secs: Option<Option<u64>>,
}

/// Event delivered to subscription handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Message { subscription: u64, record: Record },
    Batch { subscription: u64, records: Vec<Record> },
    RateLimited { subscription: u64 },
    Removed { subscription: u64 },
}

/// Introspection snapshot of one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub id: u64,
    pub config: SubscriptionConfig,
    pub status: SubscriptionStatus,
    pub message_count: u64,
    pub last_message_at: Option<i64>,
    pub created_at: i64,
}

struct Subscription {
    config: SubscriptionConfig,
    status: SubscriptionStatus,
    message_count: u64,
    last_message_at: Option<i64>,
    created_at: i64,
    bucket: Option<TokenBucket>,
    batch_buffer: Vec<Record>,
    batch_window_started_at: Option<i64>,
}

impl Subscription {
    fn info(&self, id: u64) -> SubscriptionInfo {
        SubscriptionInfo {
            id,
            config: self.config.clone(),
            status: self.status,
            message_count: self.message_count,
            last_message_at: self.last_message_at,
            created_at: self.created_at,
        }
    }
}

struct Inner {
    next_id: u64,
    subs: HashMap<u64, Subscription>,
    handlers: HashMap<u64, Vec<mpsc::Sender<SubscriptionEvent>>>,
    wildcard_handlers: Vec<mpsc::Sender<SubscriptionEvent>>,
}

/// Stateful registry of subscriptions plus the dispatch path.
///
/// Dispatch runs on the calling task — no extra hop — which keeps per
/// (schema, producer) ordering deterministic.
pub struct SubscriptionManager {
    registry: Arc<SchemaRegistry>,
    fields: Arc<dyn PayloadFields>,
    events: Arc<dyn EventSink>,
    inner: Mutex<Inner>,
}

impl SubscriptionManager {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        fields: Arc<dyn PayloadFields>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            fields,
            events,
            inner: Mutex::new(Inner {
                next_id: 1,
                subs: HashMap::new(),
                handlers: HashMap::new(),
                wildcard_handlers: Vec::new(),
            }),
        }
    }

    /// Validate and register a subscription. All violated constraints are
    /// reported together.
    pub fn create(&self, config: SubscriptionConfig) -> Result<u64, SdnError> {
        let mut violations = Vec::new();
        if config.schemas.is_empty() {
            violations.push("schemas must not be empty".to_string());
        }
        for schema in &config.schemas {
            if schema != WILDCARD && !self.registry.has(schema) {
                violations.push(format!("unknown schema: {schema}"));
            }
        }
        if config.source_peers.is_empty() {
            violations.push("source_peers must not be empty".to_string());
        }
        if let SubscriptionMode::Batch { batch_size, batch_interval_secs } = config.mode {
            if batch_size == 0 {
                violations.push("batch_size must be positive".to_string());
            }
            if batch_size > DEFAULT_BATCH_BUFFER_CAP {
                violations.push(format!("batch_size exceeds buffer cap {DEFAULT_BATCH_BUFFER_CAP}"));
            }
            if batch_interval_secs == 0 {
                violations.push("batch_interval_secs must be positive".to_string());
            }
        }
        if config.ttl_secs == Some(0) {
            violations.push("ttl_secs must be positive".to_string());
        }
        if !violations.is_empty() {
            return Err(SdnError::InvalidSubscription(violations));
        }

        let bucket = config.rate_limit_per_min.map(TokenBucket::new);
        let mut inner = self.inner.lock().expect("subscription mutex poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subs.insert(
            id,
            Subscription {
                config,
                status: SubscriptionStatus::Active,
                message_count: 0,
                last_message_at: None,
                created_at: chrono::Utc::now().timestamp(),
                bucket,
                batch_buffer: Vec::new(),
                batch_window_started_at: None,
            },
        );
        debug!(subscription = id, "subscription created");
        Ok(id)
    }

    /// Apply a partial update.
    pub fn update(&self, id: u64, patch: SubscriptionPatch) -> Result<(), SdnError> {
        if let Some(schemas) = &patch.schemas {
            let unknown: Vec<String> = schemas
                .iter()
                .filter(|s| s.as_str() != WILDCARD && !self.registry.has(s))
                .map(|s| format!("unknown schema: {s}"))
                .collect();
            if !unknown.is_empty() {
                return Err(SdnError::InvalidSubscription(unknown));
            }
        }
        let mut inner = self.inner.lock().expect("subscription mutex poisoned");
        let sub = inner.subs.get_mut(&id).ok_or(SdnError::NotFound)?;
        if let Some(schemas) = patch.schemas {
            sub.config.schemas = schemas;
        }
        if let Some(peers) = patch.source_peers {
            sub.config.source_peers = peers;
        }
        if let Some(filters) = patch.filters {
            sub.config.filters = filters;
        }
        if let Some(mode) = patch.encryption {
            sub.config.encryption = mode;
        }
        if let Some(rate) = patch.rate_limit_per_min {
            sub.config.rate_limit_per_min = rate;
            sub.bucket = rate.map(TokenBucket::new);
        }
        if let Some(ttl) = patch.ttl_secs {
            sub.config.ttl_secs = ttl;
        }
        Ok(())
    }

    pub fn pause(&self, id: u64) -> Result<(), SdnError> {
        self.set_status(id, SubscriptionStatus::Paused)
    }

    pub fn resume(&self, id: u64) -> Result<(), SdnError> {
        self.set_status(id, SubscriptionStatus::Active)
    }

    fn set_status(&self, id: u64, status: SubscriptionStatus) -> Result<(), SdnError> {
        let mut inner = self.inner.lock().expect("subscription mutex poisoned");
        let sub = inner.subs.get_mut(&id).ok_or(SdnError::NotFound)?;
        sub.status = status;
        Ok(())
    }

    /// Remove a subscription; a pending batch buffer is flushed first.
    pub fn remove(&self, id: u64) -> Result<(), SdnError> {
        let mut inner = self.inner.lock().expect("subscription mutex poisoned");
        let mut sub = inner.subs.remove(&id).ok_or(SdnError::NotFound)?;
        if !sub.batch_buffer.is_empty() {
            let records = std::mem::take(&mut sub.batch_buffer);
            Self::deliver(&mut inner, id, SubscriptionEvent::Batch { subscription: id, records });
        }
        Self::deliver(&mut inner, id, SubscriptionEvent::Removed { subscription: id });
        inner.handlers.remove(&id);
        debug!(subscription = id, "subscription removed");
        Ok(())
    }

    /// Remove the streaming subscriptions owned by a client session. Single
    /// and batch subscriptions outlive their session and only go away through
    /// explicit removal (or, for single, first-match auto-removal).
    pub fn remove_session(&self, session: &str) {
        let ids: Vec<u64> = {
            let inner = self.inner.lock().expect("subscription mutex poisoned");
            inner
                .subs
                .iter()
                .filter(|(_, s)| {
                    s.config.session.as_deref() == Some(session)
                        && matches!(s.config.mode, SubscriptionMode::Streaming)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            let _ = self.remove(id);
        }
    }

    pub fn get(&self, id: u64) -> Result<SubscriptionInfo, SdnError> {
        let inner = self.inner.lock().expect("subscription mutex poisoned");
        inner.subs.get(&id).map(|s| s.info(id)).ok_or(SdnError::NotFound)
    }

    pub fn list(&self) -> Vec<SubscriptionInfo> {
        let inner = self.inner.lock().expect("subscription mutex poisoned");
        let mut out: Vec<SubscriptionInfo> =
            inner.subs.iter().map(|(id, s)| s.info(*id)).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Register a handler channel for one subscription.
    pub fn handler(&self, id: u64, capacity: usize) -> Result<mpsc::Receiver<SubscriptionEvent>, SdnError> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut inner = self.inner.lock().expect("subscription mutex poisoned");
        if !inner.subs.contains_key(&id) {
            return Err(SdnError::NotFound);
        }
        inner.handlers.entry(id).or_default().push(tx);
        Ok(rx)
    }

    /// Register a wildcard handler receiving events for every subscription.
    pub fn wildcard_handler(&self, capacity: usize) -> mpsc::Receiver<SubscriptionEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut inner = self.inner.lock().expect("subscription mutex poisoned");
        inner.wildcard_handlers.push(tx);
        rx
    }

    fn deliver(inner: &mut Inner, id: u64, event: SubscriptionEvent) {
        if let Some(handlers) = inner.handlers.get(&id) {
            for tx in handlers {
                if tx.try_send(event.clone()).is_err() {
                    debug!(subscription = id, "handler channel full; event dropped");
                }
            }
        }
        for tx in &inner.wildcard_handlers {
            if tx.try_send(event.clone()).is_err() {
                debug!(subscription = id, "wildcard handler channel full; event dropped");
            }
        }
    }

    fn matches(&self, sub: &Subscription, record: &Record, from: &PeerId, encrypted: bool) -> bool {
        if sub.status != SubscriptionStatus::Active {
            return false;
        }
        let schema_ok = sub
            .config
            .schemas
            .iter()
            .any(|s| s == WILDCARD || s == &record.schema_name);
        if !schema_ok {
            return false;
        }
        let source_ok = sub
            .config
            .source_peers
            .iter()
            .any(|p| p == WILDCARD || p == from.as_str());
        if !source_ok {
            return false;
        }
        match sub.config.encryption {
            EncryptionMode::PlaintextOnly if encrypted => return false,
            EncryptionMode::EncryptedOnly if !encrypted => return false,
            _ => {}
        }
        sub.config.filters.iter().all(|p| {
            // Encrypted payloads cannot be decoded: every field reads as
            // missing.
            let field = if encrypted {
                None
            } else {
                self.fields.get(&record.schema_name, &record.payload, &p.field)
            };
            p.eval(field.as_ref())
        })
    }

    /// Drop expired subscriptions and flush batch buffers whose interval has
    /// elapsed. Call periodically.
    pub fn sweep(&self) {
        self.sweep_at(chrono::Utc::now().timestamp())
    }

    pub fn sweep_at(&self, now: i64) {
        let mut expired = Vec::new();
        {
            let mut inner = self.inner.lock().expect("subscription mutex poisoned");
            let mut flushes = Vec::new();
            for (id, sub) in inner.subs.iter_mut() {
                if let Some(ttl) = sub.config.ttl_secs {
                    if now - sub.created_at >= ttl as i64 {
                        expired.push(*id);
                        continue;
                    }
                }
                if let SubscriptionMode::Batch { batch_interval_secs, .. } = sub.config.mode {
                    let due = sub
                        .batch_window_started_at
                        .is_some_and(|start| now - start >= batch_interval_secs as i64);
                    if due && !sub.batch_buffer.is_empty() {
                        let records = std::mem::take(&mut sub.batch_buffer);
                        sub.batch_window_started_at = None;
                        flushes.push((*id, records));
                    }
                }
            }
            for (id, records) in flushes {
                Self::deliver(&mut inner, id, SubscriptionEvent::Batch { subscription: id, records });
            }
        }
        for id in expired {
            let _ = self.remove(id);
        }
    }

    /// Dispatch one record to every matching active subscription.
    pub fn dispatch_record(&self, record: &Record, from: &PeerId, encrypted: bool) {
        let now = chrono::Utc::now().timestamp();
        let mut to_remove = Vec::new();
        {
            let mut inner = self.inner.lock().expect("subscription mutex poisoned");
            let mut ids: Vec<u64> = inner.subs.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                // Decide the outcome under a scoped borrow, then deliver.
                let outcome = {
                    let sub = inner.subs.get_mut(&id).expect("id from keys");
                    if !self.matches(sub, record, from, encrypted) {
                        continue;
                    }
                    let rate_limited = sub
                        .bucket
                        .as_mut()
                        .is_some_and(|bucket| !bucket.try_consume_at(now));
                    if rate_limited {
                        Some(SubscriptionEvent::RateLimited { subscription: id })
                    } else {
                        sub.message_count += 1;
                        sub.last_message_at = Some(now);
                        match sub.config.mode {
                            SubscriptionMode::Single => {
                                to_remove.push(id);
                                Some(SubscriptionEvent::Message {
                                    subscription: id,
                                    record: record.clone(),
                                })
                            }
                            SubscriptionMode::Streaming => Some(SubscriptionEvent::Message {
                                subscription: id,
                                record: record.clone(),
                            }),
                            SubscriptionMode::Batch { batch_size, .. } => {
                                if sub.batch_buffer.len() >= DEFAULT_BATCH_BUFFER_CAP {
                                    warn!(subscription = id, "batch buffer full; record dropped");
                                    None
                                } else {
                                    if sub.batch_window_started_at.is_none() {
                                        sub.batch_window_started_at = Some(now);
                                    }
                                    sub.batch_buffer.push(record.clone());
                                    if sub.batch_buffer.len() >= batch_size {
                                        let records = std::mem::take(&mut sub.batch_buffer);
                                        sub.batch_window_started_at = None;
                                        Some(SubscriptionEvent::Batch {
                                            subscription: id,
                                            records,
                                        })
                                    } else {
                                        None
                                    }
                                }
                            }
                        }
                    }
                };
                if let Some(event) = outcome {
                    if matches!(event, SubscriptionEvent::RateLimited { .. }) {
                        self.events
                            .emit(NodeEvent::RateLimited { scope: format!("subscription:{id}") });
                    }
                    Self::deliver(&mut inner, id, event);
                }
            }
        }
        for id in to_remove {
            let _ = self.remove(id);
        }
    }
}

impl SubscriptionDispatcher for SubscriptionManager {
    fn dispatch(&self, record: &Record, from: &PeerId, encrypted: bool) {
        self.dispatch_record(record, from, encrypted);
    }
}
