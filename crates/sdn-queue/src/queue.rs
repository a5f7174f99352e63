use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use sdn_core::{
    Cid, EventSink, NodeEvent, PeerId, Pnm, PolicyConfig, Record, ResolvedPolicy, SdnError,
    SubscriptionDispatcher, DEFAULT_FETCH_CONCURRENCY, DEFAULT_MAX_FETCH_ATTEMPTS,
    DEFAULT_MAX_QUEUE_SIZE, DEFAULT_TIP_GRACE_SECS, PRIORITY_BYPASS_THRESHOLD,
};
use sdn_schema::SchemaRegistry;
use sdn_store::Store;
use sdn_trust::FailureTracker;

use crate::tip::{ContentFetcher, Tip};

#[derive(Debug, Clone)]
pub struct TipQueueConfig {
    pub max_queue_size: usize,
    pub fetch_concurrency: usize,
    pub max_fetch_attempts: u32,
    /// Fetched-but-unpinned (and failed) tips older than this are collected.
    pub grace_secs: u64,
}

impl Default for TipQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            max_fetch_attempts: DEFAULT_MAX_FETCH_ATTEMPTS,
            grace_secs: DEFAULT_TIP_GRACE_SECS,
        }
    }
}

/// One queued fetch. Ordered for the scheduler's max-heap: higher priority
/// first, then FIFO on receipt time, then CID to keep ordering total.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FetchJob {
    cid: Cid,
    priority: u8,
    received_at: i64,
}

impl Ord for FetchJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.received_at.cmp(&self.received_at))
            .then_with(|| other.cid.cmp(&self.cid))
    }
}

impl PartialOrd for FetchJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The PNM pipeline: consumes publication notifications from gossip,
/// resolves policy, schedules verified fetches on a bounded priority worker
/// pool, pins records, and ages tips out.
pub struct TipQueue {
    config: TipQueueConfig,
    policy: RwLock<PolicyConfig>,
    tips: RwLock<HashMap<Cid, Tip>>,
    registry: Arc<SchemaRegistry>,
    store: Arc<Store>,
    fetcher: Arc<dyn ContentFetcher>,
    dispatcher: Option<Arc<dyn SubscriptionDispatcher>>,
    failures: Arc<FailureTracker>,
    events: Arc<dyn EventSink>,
    fetch_tx: Mutex<Option<mpsc::Sender<FetchJob>>>,
    /// PNMs dropped at the topic handler (queue pressure, unknown schema,
    /// bad signatures). Gossip is lossy by design; no NACK is sent.
    dropped: AtomicU64,
}

impl TipQueue {
    /// Build the queue and start its fetch scheduler.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: TipQueueConfig,
        policy: PolicyConfig,
        registry: Arc<SchemaRegistry>,
        store: Arc<Store>,
        fetcher: Arc<dyn ContentFetcher>,
        dispatcher: Option<Arc<dyn SubscriptionDispatcher>>,
        failures: Arc<FailureTracker>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let (fetch_tx, fetch_rx) = mpsc::channel(config.max_queue_size.max(64));
        let queue = Arc::new(Self {
            config,
            policy: RwLock::new(policy),
            tips: RwLock::new(HashMap::new()),
            registry,
            store,
            fetcher,
            dispatcher,
            failures,
            events,
            fetch_tx: Mutex::new(Some(fetch_tx)),
            dropped: AtomicU64::new(0),
        });
        tokio::spawn(Self::scheduler(Arc::clone(&queue), fetch_rx));
        queue
    }

    /// Stop accepting fetch work; the scheduler drains and exits.
    pub fn shutdown(&self) {
        self.fetch_tx.lock().expect("fetch channel mutex poisoned").take();
        info!("tip queue shut down");
    }

    /// Replace the policy hierarchy (operator reconfiguration).
    pub fn set_policy(&self, policy: PolicyConfig) {
        *self.policy.write().expect("policy lock") = policy;
    }

    pub fn resolve_policy(&self, producer: &PeerId, schema: &str) -> ResolvedPolicy {
        self.policy.read().expect("policy lock").resolve(producer, schema)
    }

    pub fn tip_count(&self) -> usize {
        self.tips.read().expect("tip lock").len()
    }

    pub fn tip(&self, cid: &Cid) -> Option<Tip> {
        self.tips.read().expect("tip lock").get(cid).cloned()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ingest one PNM from the gossip topic.
    pub fn ingest(&self, pnm: Pnm) {
        self.ingest_at(pnm, chrono::Utc::now().timestamp())
    }

    pub fn ingest_at(&self, pnm: Pnm, now: i64) {
        let schema = pnm.schema_name.clone();
        if !self.registry.has(&schema) {
            debug!(schema = %schema, "PNM for unknown schema dropped");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if sdn_crypto::verify_from_peer(&pnm.producer, &pnm.cid_signing_bytes(), &pnm.cid_signature)
            .is_err()
        {
            debug!(peer = %pnm.producer, "PNM with bad CID signature dropped");
            self.failures.record_failure(&pnm.producer);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let cid = pnm.cid;
        let producer = pnm.producer.clone();
        let policy = self.resolve_policy(&producer, &schema);

        // Already stored: the tip is only bookkeeping.
        if self.store.contains(&cid).unwrap_or(false) {
            let mut tips = self.tips.write().expect("tip lock");
            match tips.get_mut(&cid) {
                Some(tip) => {
                    tip.fetched = true;
                    tip.seen_count += 1;
                }
                None => {
                    let mut tip = Tip::new(pnm, now, policy);
                    tip.fetched = true;
                    tips.insert(cid, tip);
                }
            }
            return;
        }

        let mut enqueue = false;
        {
            let mut tips = self.tips.write().expect("tip lock");
            if let Some(tip) = tips.get_mut(&cid) {
                tip.seen_count += 1;
                let source = (pnm.producer.clone(), pnm.multi_addr.clone());
                let known = tip.pnm.producer == source.0 && tip.pnm.multi_addr == source.1;
                if !known && !tip.alternates.contains(&source) {
                    tip.alternates.push(source);
                }
                // A re-announce revives a failed tip.
                if tip.failed {
                    tip.failed = false;
                    tip.attempts = 0;
                    enqueue = tip.policy.auto_fetch;
                }
            } else {
                if tips.len() >= self.config.max_queue_size {
                    // Deterministic eviction: the unfetched tip (incoming
                    // included) with the lowest priority, earliest receipt,
                    // smallest CID loses.
                    let mut victim = (policy.priority, now, cid);
                    for (tip_cid, tip) in tips.iter() {
                        if tip.fetched {
                            continue;
                        }
                        let key = (tip.policy.priority, tip.received_at, *tip_cid);
                        if key < victim {
                            victim = key;
                        }
                    }
                    if victim.2 == cid {
                        debug!(cid = %cid, "queue full; incoming tip dropped");
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    tips.remove(&victim.2);
                    debug!(cid = %victim.2, "tip evicted under queue pressure");
                }
                tips.insert(cid, Tip::new(pnm, now, policy));
                enqueue = policy.auto_fetch;
                self.events.emit(NodeEvent::TipReceived {
                    cid,
                    schema: schema.clone(),
                    producer: producer.clone(),
                });
            }
        }

        if enqueue {
            self.enqueue_fetch(cid, policy.priority, now);
        }
    }

    fn enqueue_fetch(&self, cid: Cid, priority: u8, received_at: i64) {
        let guard = self.fetch_tx.lock().expect("fetch channel mutex poisoned");
        let Some(tx) = guard.as_ref() else { return };
        if tx.try_send(FetchJob { cid, priority, received_at }).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(cid = %cid, "fetch queue full; job dropped");
        }
    }

    /// Scheduler: admits queued jobs to a bounded worker pool in priority
    /// order. Jobs at or above the bypass threshold skip admission entirely.
    async fn scheduler(queue: Arc<Self>, mut rx: mpsc::Receiver<FetchJob>) {
        let semaphore = Arc::new(Semaphore::new(queue.config.fetch_concurrency));
        let mut heap: BinaryHeap<FetchJob> = BinaryHeap::new();
        loop {
            tokio::select! {
                maybe_job = rx.recv() => match maybe_job {
                    Some(job) => {
                        if job.priority >= PRIORITY_BYPASS_THRESHOLD {
                            let q = Arc::clone(&queue);
                            tokio::spawn(async move { q.run_fetch(job).await });
                        } else {
                            heap.push(job);
                        }
                    }
                    None => break,
                },
                permit = Arc::clone(&semaphore).acquire_owned(), if !heap.is_empty() => {
                    let Ok(permit) = permit else { break };
                    if let Some(job) = heap.pop() {
                        let q = Arc::clone(&queue);
                        tokio::spawn(async move {
                            q.run_fetch(job).await;
                            drop(permit);
                        });
                    }
                }
            }
        }
        debug!("fetch scheduler exited");
    }

    /// One fetch attempt cycle for a tip: rotate through announced sources
    /// until the record verifies or the attempt budget is spent.
    async fn run_fetch(&self, job: FetchJob) {
        let (pnm, sources, policy, start_attempt) = {
            let tips = self.tips.read().expect("tip lock");
            let Some(tip) = tips.get(&job.cid) else { return };
            if tip.fetched || tip.failed {
                return;
            }
            (tip.pnm.clone(), tip.sources(), tip.policy, tip.attempts)
        };

        let timeout = Duration::from_secs(policy.fetch_timeout_secs.max(1));
        let mut attempt = start_attempt;
        while attempt < self.config.max_fetch_attempts {
            let (peer, addr) = sources[attempt as usize % sources.len()].clone();
            let outcome = tokio::time::timeout(
                timeout,
                self.fetcher.fetch(&peer, &addr, &job.cid, &pnm.schema_name, timeout),
            )
            .await;

            match outcome {
                Ok(Ok(fetched)) => {
                    match self.accept_fetched(&pnm, policy, fetched.payload, fetched.signature) {
                        Ok(()) => return,
                        Err(e) => {
                            // Verification failure burns the tip; no retry.
                            debug!(cid = %job.cid, error = %e, "fetched record rejected");
                            return;
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!(cid = %job.cid, peer = %peer, error = %e, "fetch attempt failed");
                }
                Err(_) => {
                    debug!(cid = %job.cid, peer = %peer, "fetch attempt timed out");
                }
            }

            attempt += 1;
            let mut tips = self.tips.write().expect("tip lock");
            if let Some(tip) = tips.get_mut(&job.cid) {
                tip.attempts = attempt;
                if attempt >= self.config.max_fetch_attempts {
                    tip.failed = true;
                    warn!(cid = %job.cid, attempts = attempt, "tip marked failed");
                }
            } else {
                return;
            }
        }
    }

    /// Validate a fetched record (schema, CID, signature), then pin and/or
    /// dispatch it per the tip's resolved policy.
    fn accept_fetched(
        &self,
        pnm: &Pnm,
        policy: ResolvedPolicy,
        payload: Vec<u8>,
        signature: Vec<u8>,
    ) -> Result<(), SdnError> {
        let verified = self
            .registry
            .validate(&pnm.schema_name, &payload)
            .and_then(|()| {
                if Cid::of(&payload) != pnm.cid {
                    return Err(SdnError::SchemaValidationFailed(
                        "payload does not hash to announced CID".into(),
                    ));
                }
                Ok(())
            })
            .and_then(|()| sdn_crypto::verify_from_peer(&pnm.producer, &payload, &signature));

        if let Err(e) = verified {
            self.tips.write().expect("tip lock").remove(&pnm.cid);
            if self.failures.record_failure(&pnm.producer) {
                warn!(peer = %pnm.producer, "producer quarantined after bad records");
            }
            return Err(e);
        }

        let now = chrono::Utc::now().timestamp();
        let record = Record {
            schema_name: pnm.schema_name.clone(),
            payload,
            signature,
            producer: pnm.producer.clone(),
            received_at: now,
        };

        let mut dispatch = true;
        if policy.auto_pin {
            let outcome =
                self.store.put(&record.schema_name, &record.payload, &record.producer, &record.signature)?;
            if outcome.inserted {
                self.events.emit(NodeEvent::RecordStored {
                    cid: outcome.cid,
                    schema: record.schema_name.clone(),
                });
            }
            // The insert is the dedup linearization point: a racing push
            // already dispatched this record if we lost.
            dispatch = outcome.inserted;
        }

        {
            let mut tips = self.tips.write().expect("tip lock");
            if let Some(tip) = tips.get_mut(&pnm.cid) {
                tip.fetched = true;
                tip.failed = false;
                if policy.auto_pin {
                    tip.pinned = true;
                    tip.pin_expiry = Some(now + policy.ttl_secs as i64);
                }
            }
        }
        self.failures.record_success(&pnm.producer);
        self.events.emit(NodeEvent::TipFetched { cid: pnm.cid });

        if dispatch {
            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.dispatch(&record, &pnm.producer, false);
            }
        }
        Ok(())
    }

    /// One garbage-collection pass: expire pins (tip and storage row) and
    /// drop fetched/failed tips past the grace window.
    pub fn gc_once(&self) {
        self.gc_once_at(chrono::Utc::now().timestamp())
    }

    pub fn gc_once_at(&self, now: i64) {
        let mut expired_pins = Vec::new();
        let mut stale = Vec::new();
        {
            let tips = self.tips.read().expect("tip lock");
            for (cid, tip) in tips.iter() {
                if tip.pinned {
                    if tip.pin_expiry.is_some_and(|e| e <= now) {
                        expired_pins.push(*cid);
                    }
                } else if (tip.fetched || tip.failed)
                    && now - tip.received_at > self.config.grace_secs as i64
                {
                    stale.push(*cid);
                }
            }
        }

        for cid in expired_pins {
            if let Err(e) = self.store.delete(&cid) {
                warn!(cid = %cid, error = %e, "failed to evict expired pin");
                continue;
            }
            self.tips.write().expect("tip lock").remove(&cid);
            self.events.emit(NodeEvent::TipExpired { cid });
            debug!(cid = %cid, "pin expired and evicted");
        }
        for cid in stale {
            self.tips.write().expect("tip lock").remove(&cid);
        }
    }

    /// Periodic GC loop. Spawn with the node's chosen interval.
    pub async fn run_gc(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.gc_once();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use sdn_core::{ChannelSink, NullSink, PolicyEntry};
    use sdn_crypto::NodeSigner;
    use sdn_schema::{JsonFields, SchemaRegistry, ValidationMode};
    use serde_json::json;

    use crate::publish::build_pnm;
    use crate::tip::FetchedRecord;

    struct StubFetcher {
        records: Mutex<HashMap<Cid, FetchedRecord>>,
        calls: AtomicU32,
        fail_next: AtomicU32,
    }

    impl StubFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                records: Mutex::new(HashMap::new()),
                calls: AtomicU32::new(0),
                fail_next: AtomicU32::new(0),
            })
        }

        fn serve(&self, cid: Cid, payload: Vec<u8>, signature: Vec<u8>) {
            self.records.lock().unwrap().insert(cid, FetchedRecord { payload, signature });
        }

        fn fail_next(&self, n: u32) {
            self.fail_next.store(n, Ordering::SeqCst);
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContentFetcher for StubFetcher {
        async fn fetch(
            &self,
            _producer: &PeerId,
            _multiaddr: &str,
            cid: &Cid,
            _schema: &str,
            _timeout: Duration,
        ) -> Result<FetchedRecord, SdnError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SdnError::Timeout);
            }
            self.records.lock().unwrap().get(cid).cloned().ok_or(SdnError::NotFound)
        }
    }

    struct RecordingDispatcher {
        count: AtomicU32,
    }

    impl RecordingDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self { count: AtomicU32::new(0) })
        }
    }

    impl SubscriptionDispatcher for RecordingDispatcher {
        fn dispatch(&self, _record: &Record, _from: &PeerId, _encrypted: bool) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Pipeline {
        queue: Arc<TipQueue>,
        store: Arc<Store>,
        fetcher: Arc<StubFetcher>,
        dispatcher: Arc<RecordingDispatcher>,
        failures: Arc<FailureTracker>,
        signer: NodeSigner,
    }

    fn omm_policy() -> PolicyConfig {
        let mut policy = PolicyConfig::default();
        policy.schema_defaults.insert(
            "OMM".into(),
            PolicyEntry {
                auto_fetch: Some(true),
                auto_pin: Some(true),
                ttl_secs: Some(3600),
                priority: Some(5),
                ..Default::default()
            },
        );
        policy
    }

    fn pipeline(config: TipQueueConfig, policy: PolicyConfig) -> Pipeline {
        pipeline_with(config, policy, Arc::new(NullSink))
    }

    fn pipeline_with(
        config: TipQueueConfig,
        policy: PolicyConfig,
        events: Arc<dyn EventSink>,
    ) -> Pipeline {
        let registry = Arc::new(SchemaRegistry::new("spacedata", ValidationMode::Strict));
        let store =
            Arc::new(Store::open_in_memory(Arc::clone(&registry), Arc::new(JsonFields)).unwrap());
        let fetcher = StubFetcher::new();
        let dispatcher = RecordingDispatcher::new();
        let failures = Arc::new(FailureTracker::new(3, 600));
        let queue = TipQueue::spawn(
            config,
            policy,
            registry,
            Arc::clone(&store),
            fetcher.clone() as Arc<dyn ContentFetcher>,
            Some(dispatcher.clone() as Arc<dyn SubscriptionDispatcher>),
            Arc::clone(&failures),
            events,
        );
        Pipeline { queue, store, fetcher, dispatcher, failures, signer: NodeSigner::generate() }
    }

    fn omm_payload(object_id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "OBJECT_ID": object_id,
            "EPOCH": "2024-01-15T12:00:00Z",
            "INCLINATION": 51.6,
        }))
        .unwrap()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn auto_fetch_pins_and_dispatches() {
        let p = pipeline(TipQueueConfig::default(), omm_policy());
        let payload = omm_payload("1998-067A");
        let cid = Cid::of(&payload);
        p.fetcher.serve(cid, payload.clone(), p.signer.sign(&payload));

        let pnm = build_pnm(&p.signer, cid, "OMM", "/ip4/127.0.0.1/tcp/4001", None);
        p.queue.ingest(pnm);

        assert!(wait_until(|| p.store.contains(&cid).unwrap()).await, "record never stored");
        let tip = p.queue.tip(&cid).unwrap();
        assert!(tip.fetched);
        assert!(tip.pinned);
        assert!(tip.pin_expiry.unwrap() > chrono::Utc::now().timestamp());
        assert!(wait_until(|| p.dispatcher.count.load(Ordering::SeqCst) == 1).await);

        // Stored bytes are bitwise identical to the producer's payload.
        let record = p.store.get(&cid).unwrap();
        assert_eq!(record.payload, payload);
    }

    #[tokio::test]
    async fn duplicate_announce_is_one_tip_with_seen_count() {
        let p = pipeline(TipQueueConfig::default(), omm_policy());
        let payload = omm_payload("1998-067A");
        let cid = Cid::of(&payload);
        p.fetcher.serve(cid, payload.clone(), p.signer.sign(&payload));

        let pnm = build_pnm(&p.signer, cid, "OMM", "/ip4/127.0.0.1/tcp/4001", None);
        p.queue.ingest(pnm.clone());
        p.queue.ingest(pnm);

        assert!(wait_until(|| p.store.contains(&cid).unwrap()).await);
        assert_eq!(p.queue.tip_count(), 1);
        assert_eq!(p.queue.tip(&cid).unwrap().seen_count, 2);
        // Dispatched once despite the double announce.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(p.dispatcher.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_announcer_becomes_alternate_source() {
        let p = pipeline(TipQueueConfig::default(), omm_policy());
        // No record served: the fetch keeps failing while we observe tips.
        let payload = omm_payload("1998-067A");
        let cid = Cid::of(&payload);

        let pnm_a = build_pnm(&p.signer, cid, "OMM", "/ip4/10.0.0.1/tcp/4001", None);
        let other = NodeSigner::generate();
        let pnm_b = build_pnm(&other, cid, "OMM", "/ip4/10.0.0.2/tcp/4001", None);

        p.queue.ingest(pnm_a);
        p.queue.ingest(pnm_b);

        let tip = p.queue.tip(&cid).unwrap();
        assert_eq!(tip.seen_count, 2);
        assert_eq!(tip.alternates.len(), 1);
        assert_eq!(tip.alternates[0].1, "/ip4/10.0.0.2/tcp/4001");
    }

    #[tokio::test]
    async fn already_stored_cid_is_not_refetched() {
        let p = pipeline(TipQueueConfig::default(), omm_policy());
        let payload = omm_payload("1998-067A");
        let sig = p.signer.sign(&payload);
        let outcome = p.store.put("OMM", &payload, &p.signer.peer_id(), &sig).unwrap();

        let pnm = build_pnm(&p.signer, outcome.cid, "OMM", "/ip4/127.0.0.1/tcp/4001", None);
        p.queue.ingest(pnm);

        let tip = p.queue.tip(&outcome.cid).unwrap();
        assert!(tip.fetched);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(p.fetcher.calls(), 0, "no fetch for an already-stored CID");
    }

    #[tokio::test]
    async fn bad_cid_signature_drops_pnm() {
        let p = pipeline(TipQueueConfig::default(), omm_policy());
        let payload = omm_payload("1998-067A");
        let mut pnm =
            build_pnm(&p.signer, Cid::of(&payload), "OMM", "/ip4/127.0.0.1/tcp/4001", None);
        pnm.cid_signature = vec![0u8; 64];
        p.queue.ingest(pnm);

        assert_eq!(p.queue.tip_count(), 0);
        assert_eq!(p.queue.dropped_count(), 1);
    }

    #[tokio::test]
    async fn unknown_schema_pnm_is_dropped() {
        let p = pipeline(TipQueueConfig::default(), omm_policy());
        let pnm = build_pnm(&p.signer, Cid::of(b"x"), "NOPE", "/ip4/127.0.0.1/tcp/1", None);
        p.queue.ingest(pnm);
        assert_eq!(p.queue.tip_count(), 0);
        assert_eq!(p.queue.dropped_count(), 1);
    }

    #[tokio::test]
    async fn mismatched_fetched_payload_is_rejected_and_blamed() {
        let p = pipeline(TipQueueConfig::default(), omm_policy());
        let payload = omm_payload("1998-067A");
        let cid = Cid::of(&payload);
        // Serve different bytes than announced.
        let wrong = omm_payload("2024-001A");
        p.fetcher.serve(cid, wrong.clone(), p.signer.sign(&wrong));

        let pnm = build_pnm(&p.signer, cid, "OMM", "/ip4/127.0.0.1/tcp/4001", None);
        let producer = pnm.producer.clone();
        p.queue.ingest(pnm);

        assert!(wait_until(|| p.queue.tip(&cid).is_none()).await, "tip not dropped");
        assert!(!p.store.contains(&cid).unwrap());
        // One verification failure on the producer's account so far.
        p.failures.record_failure(&producer);
        p.failures.record_failure(&producer);
        assert!(p.failures.is_quarantined(&producer), "third failure quarantines");
    }

    #[tokio::test]
    async fn failed_tip_revives_on_reannounce() {
        let config = TipQueueConfig { max_fetch_attempts: 2, ..Default::default() };
        let p = pipeline(config, omm_policy());
        let payload = omm_payload("1998-067A");
        let cid = Cid::of(&payload);
        p.fetcher.fail_next(u32::MAX);

        let pnm = build_pnm(&p.signer, cid, "OMM", "/ip4/127.0.0.1/tcp/4001", None);
        p.queue.ingest(pnm.clone());
        assert!(wait_until(|| p.queue.tip(&cid).is_some_and(|t| t.failed)).await);

        // Later re-announce retries and succeeds.
        p.fetcher.fail_next(0);
        p.fetcher.serve(cid, payload.clone(), p.signer.sign(&payload));
        p.queue.ingest(pnm);
        assert!(wait_until(|| p.store.contains(&cid).unwrap()).await);
    }

    #[tokio::test]
    async fn eviction_is_deterministic_under_pressure() {
        // Three schemas with distinct priorities, none auto-fetching so every
        // tip stays unfetched.
        let mut policy = PolicyConfig::default();
        for (schema, priority) in [("OMM", 1u8), ("CDM", 0u8), ("OEM", 2u8)] {
            policy.schema_defaults.insert(
                schema.into(),
                PolicyEntry {
                    auto_fetch: Some(false),
                    priority: Some(priority),
                    ..Default::default()
                },
            );
        }
        let config = TipQueueConfig { max_queue_size: 2, ..Default::default() };
        let p = pipeline(config, policy);

        let a = build_pnm(&p.signer, Cid::of(b"a"), "OMM", "/ip4/1.1.1.1/tcp/1", None);
        let b = build_pnm(&p.signer, Cid::of(b"b"), "CDM", "/ip4/1.1.1.2/tcp/1", None);
        let c = build_pnm(&p.signer, Cid::of(b"c"), "CDM", "/ip4/1.1.1.3/tcp/1", None);
        p.queue.ingest_at(a.clone(), 100);
        p.queue.ingest_at(b.clone(), 100);
        // C: same priority as B but earlier receipt — C itself is the victim.
        p.queue.ingest_at(c.clone(), 50);
        assert!(p.queue.tip(&a.cid).is_some());
        assert!(p.queue.tip(&b.cid).is_some());
        assert!(p.queue.tip(&c.cid).is_none());

        // D outranks everyone; B (lowest priority) is evicted.
        let d = build_pnm(&p.signer, Cid::of(b"d"), "OEM", "/ip4/1.1.1.4/tcp/1", None);
        p.queue.ingest_at(d.clone(), 200);
        assert!(p.queue.tip(&a.cid).is_some());
        assert!(p.queue.tip(&b.cid).is_none());
        assert!(p.queue.tip(&d.cid).is_some());
    }

    #[tokio::test]
    async fn pin_expiry_evicts_record_within_one_gc_pass() {
        let (sink, mut events) = ChannelSink::new(64);
        let p = pipeline_with(TipQueueConfig::default(), omm_policy(), sink);
        let payload = omm_payload("1998-067A");
        let cid = Cid::of(&payload);
        p.fetcher.serve(cid, payload.clone(), p.signer.sign(&payload));
        p.queue.ingest(build_pnm(&p.signer, cid, "OMM", "/ip4/127.0.0.1/tcp/4001", None));
        assert!(wait_until(|| p.store.contains(&cid).unwrap()).await);

        let expiry = p.queue.tip(&cid).unwrap().pin_expiry.unwrap();
        p.queue.gc_once_at(expiry - 1);
        assert!(p.store.contains(&cid).unwrap(), "pin still live before expiry");

        p.queue.gc_once_at(expiry);
        assert!(!p.store.contains(&cid).unwrap(), "row evicted with the pin");
        assert!(p.queue.tip(&cid).is_none());

        let mut saw_expired = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, NodeEvent::TipExpired { cid: c } if c == cid) {
                saw_expired = true;
            }
        }
        assert!(saw_expired, "TipExpired event emitted");
    }

    #[tokio::test]
    async fn stale_fetched_tip_is_collected_after_grace() {
        let mut policy = omm_policy();
        // Fetch but do not pin.
        policy.schema_defaults.get_mut("OMM").unwrap().auto_pin = Some(false);
        let config = TipQueueConfig { grace_secs: 60, ..Default::default() };
        let p = pipeline(config, policy);

        let payload = omm_payload("1998-067A");
        let cid = Cid::of(&payload);
        p.fetcher.serve(cid, payload.clone(), p.signer.sign(&payload));
        p.queue.ingest_at(
            build_pnm(&p.signer, cid, "OMM", "/ip4/127.0.0.1/tcp/4001", None),
            chrono::Utc::now().timestamp(),
        );
        assert!(wait_until(|| p.queue.tip(&cid).is_some_and(|t| t.fetched)).await);
        assert!(!p.store.contains(&cid).unwrap(), "unpinned record is not stored");
        assert!(wait_until(|| p.dispatcher.count.load(Ordering::SeqCst) == 1).await);

        let received = p.queue.tip(&cid).unwrap().received_at;
        p.queue.gc_once_at(received + 61);
        assert!(p.queue.tip(&cid).is_none());
    }
}
