//! Protocol-wide constants and tunable defaults.

/// Topic and protocol-id prefix. Topics are `/<prefix>/sds/<SCHEMA>`.
pub const DEFAULT_TOPIC_PREFIX: &str = "spacedata";

/// Schema name of publication notification messages.
pub const PNM_SCHEMA: &str = "PNM";

/// Schema name of entity profile messages.
pub const EPM_SCHEMA: &str = "EPM";

/// Gossip topic suffix for edge-relay announcements.
pub const EDGE_RELAY_TOPIC_SUFFIX: &str = "edge-relays";

/// Namespace string hashed together with the node public key to form the
/// identity CID advertised on the DHT.
pub const IDENTITY_CID_NAMESPACE: &str = "sdn-node-identity:";

// ── Exchange protocol ────────────────────────────────────────────────────────

/// Hard cap on an exchange message payload. Reads beyond this fail with
/// `MessageTooLarge`.
pub const MAX_EXCHANGE_PAYLOAD: usize = 10 * 1024 * 1024;

/// Ed25519 signature length appended to PushData payloads.
pub const PUSH_SIGNATURE_LEN: usize = 64;

// ── Tip queue ────────────────────────────────────────────────────────────────

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 4096;
pub const DEFAULT_FETCH_CONCURRENCY: usize = 16;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_FETCH_ATTEMPTS: u32 = 3;

/// Fetch jobs at or above this priority bypass the admission queue.
pub const PRIORITY_BYPASS_THRESHOLD: u8 = 200;

/// Fetched-but-unpinned tips older than this are collected.
pub const DEFAULT_TIP_GRACE_SECS: u64 = 300;

// ── Trust / rate limiting ────────────────────────────────────────────────────

/// Consecutive protocol or signature failures before quarantine.
pub const DEFAULT_QUARANTINE_THRESHOLD: u32 = 3;
pub const DEFAULT_QUARANTINE_COOLDOWN_SECS: u64 = 600;

// ── Auth core ────────────────────────────────────────────────────────────────

pub const CHALLENGE_TTL_SECS: i64 = 60;
pub const DEFAULT_MAX_PENDING_CHALLENGES: usize = 10_000;
pub const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 3600;
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 120;
pub const DEFAULT_MAX_RATE_LIMIT_ENTRIES: usize = 100_000;

pub const CHALLENGE_LIMIT_PER_IP: u32 = 60;
pub const CHALLENGE_LIMIT_PER_XPUB: u32 = 30;
pub const VERIFY_LIMIT_PER_IP: u32 = 120;
pub const VERIFY_LIMIT_PER_XPUB: u32 = 60;

// ── Subscriptions ────────────────────────────────────────────────────────────

pub const DEFAULT_BATCH_BUFFER_CAP: usize = 1_000;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_INTERVAL_SECS: u64 = 10;

// ── Node / transport ─────────────────────────────────────────────────────────

pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_STREAM_IDLE_SECS: u64 = 60;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 500;
pub const DEFAULT_MAX_CONNECTIONS_PER_PEER: u32 = 8;
pub const DEFAULT_MAX_STREAMS_PER_PEER: u32 = 256;
