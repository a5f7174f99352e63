use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{Cid, PeerId, Timestamp};

/// Outbound node events for observers (metrics, audit logs).
///
/// Emission never blocks the core: sinks that cannot keep up drop events and
/// count the loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    TipReceived { cid: Cid, schema: String, producer: PeerId },
    TipFetched { cid: Cid },
    TipExpired { cid: Cid },
    RecordStored { cid: Cid, schema: String },
    SessionCreated { xpub: String, at: Timestamp },
    SessionRevoked { xpub: String },
    RateLimited { scope: String },
}

/// Observer tap. Implementations must be cheap and non-blocking.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: NodeEvent);
}

/// Sink that discards everything. Used when no observer is attached.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: NodeEvent) {}
}

/// Sink backed by a bounded channel. Full channel drops the event and bumps
/// the drop counter instead of blocking the emitter.
pub struct ChannelSink {
    tx: mpsc::Sender<NodeEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Returns the sink and the receiving end for the observer task.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<NodeEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self { tx, dropped: AtomicU64::new(0) }), rx)
    }

    /// Number of events dropped because the observer lagged.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: NodeEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new(8);
        sink.emit(NodeEvent::TipFetched { cid: Cid::of(b"a") });
        sink.emit(NodeEvent::TipFetched { cid: Cid::of(b"b") });
        assert_eq!(rx.recv().await, Some(NodeEvent::TipFetched { cid: Cid::of(b"a") }));
        assert_eq!(rx.recv().await, Some(NodeEvent::TipFetched { cid: Cid::of(b"b") }));
    }

    #[tokio::test]
    async fn full_sink_drops_and_counts() {
        let (sink, _rx) = ChannelSink::new(1);
        sink.emit(NodeEvent::TipFetched { cid: Cid::of(b"a") });
        sink.emit(NodeEvent::TipFetched { cid: Cid::of(b"b") });
        assert_eq!(sink.dropped(), 1);
    }
}
