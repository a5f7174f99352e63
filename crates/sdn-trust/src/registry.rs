use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use rusqlite::{params, Connection};
use tracing::{debug, info};

use sdn_core::{PeerId, SdnError, TrustLevel};

/// A statically configured trust entry. Authoritative entries cannot be
/// changed at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigEntry {
    pub level: TrustLevel,
    pub authoritative: bool,
}

/// Peer-id → trust level, with connection gating.
///
/// Levels come first from static configuration, then from the persistent
/// store. Configuration wins whenever both exist, so operator changes take
/// effect on restart; runtime changes are persisted and apply to peers the
/// configuration does not name.
pub struct TrustRegistry {
    config: HashMap<PeerId, ConfigEntry>,
    runtime: RwLock<HashMap<PeerId, TrustLevel>>,
    db: Option<Mutex<Connection>>,
    /// Publicly reachable listener configured for open access: dial gating
    /// admits unknown peers.
    open_access: bool,
}

fn sql_err(e: rusqlite::Error) -> SdnError {
    SdnError::StorageError(e.to_string())
}

impl TrustRegistry {
    /// In-memory registry (no persistence).
    pub fn new(config: HashMap<PeerId, ConfigEntry>, open_access: bool) -> Self {
        Self { config, runtime: RwLock::new(HashMap::new()), db: None, open_access }
    }

    /// Registry persisting runtime changes to the user-records database.
    pub fn open<P: AsRef<Path>>(
        path: P,
        config: HashMap<PeerId, ConfigEntry>,
        open_access: bool,
    ) -> Result<Self, SdnError> {
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::init(conn, config, open_access)
    }

    fn init(
        conn: Connection,
        config: HashMap<PeerId, ConfigEntry>,
        open_access: bool,
    ) -> Result<Self, SdnError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS peer_trust (
                 peer_id    TEXT PRIMARY KEY,
                 level      TEXT NOT NULL,
                 updated_at INTEGER NOT NULL
             );",
        )
        .map_err(sql_err)?;

        let mut runtime = HashMap::new();
        {
            let mut stmt =
                conn.prepare("SELECT peer_id, level FROM peer_trust").map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(sql_err)?;
            for row in rows {
                let (peer, level) = row.map_err(sql_err)?;
                if let Some(level) = TrustLevel::parse(&level) {
                    runtime.insert(PeerId::new(peer), level);
                }
            }
        }
        info!(persisted = runtime.len(), configured = config.len(), "trust registry loaded");

        Ok(Self {
            config,
            runtime: RwLock::new(runtime),
            db: Some(Mutex::new(conn)),
            open_access,
        })
    }

    /// Effective trust level for a peer. A config entry always wins over the
    /// persistent store; unknown peers are `Untrusted`.
    pub fn level(&self, peer: &PeerId) -> TrustLevel {
        if let Some(entry) = self.config.get(peer) {
            return entry.level;
        }
        self.runtime
            .read()
            .expect("trust lock")
            .get(peer)
            .copied()
            .unwrap_or_default()
    }

    /// Set a peer's trust level at runtime and persist it. A config entry
    /// shadows the persisted value until the operator drops it; `Forbidden`
    /// when that entry is authoritative.
    pub fn set_level(&self, peer: &PeerId, level: TrustLevel) -> Result<(), SdnError> {
        if self.config.get(peer).is_some_and(|e| e.authoritative) {
            return Err(SdnError::Forbidden);
        }
        self.runtime.write().expect("trust lock").insert(peer.clone(), level);
        if let Some(db) = &self.db {
            let conn = db.lock().expect("trust db mutex poisoned");
            conn.execute(
                "INSERT INTO peer_trust (peer_id, level, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(peer_id) DO UPDATE SET level = ?2, updated_at = ?3",
                params![peer.as_str(), level.as_str(), chrono::Utc::now().timestamp()],
            )
            .map_err(sql_err)?;
        }
        debug!(peer = %peer, level = %level, "trust level updated");
        Ok(())
    }

    /// Remove a runtime trust entry (the peer falls back to config or
    /// `Untrusted`).
    pub fn remove(&self, peer: &PeerId) -> Result<(), SdnError> {
        self.runtime.write().expect("trust lock").remove(peer);
        if let Some(db) = &self.db {
            let conn = db.lock().expect("trust db mutex poisoned");
            conn.execute("DELETE FROM peer_trust WHERE peer_id = ?1", params![peer.as_str()])
                .map_err(sql_err)?;
        }
        Ok(())
    }

    /// Connection gate consulted by the transport before accepting a dial.
    /// Peers below `Limited` are denied unless the listener is open-access.
    pub fn gate_dial(&self, peer: &PeerId) -> bool {
        self.open_access || self.level(peer) >= TrustLevel::Limited
    }
}

/// Tracks consecutive protocol/signature failures per peer; after the
/// threshold, the peer is quarantined for a cool-down window.
pub struct FailureTracker {
    threshold: u32,
    cooldown_secs: i64,
    state: Mutex<HashMap<PeerId, FailState>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct FailState {
    consecutive: u32,
    quarantined_until: i64,
}

impl FailureTracker {
    pub fn new(threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            threshold,
            cooldown_secs: cooldown_secs as i64,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure; returns true when this failure tips the peer into
    /// quarantine.
    pub fn record_failure(&self, peer: &PeerId) -> bool {
        self.record_failure_at(peer, chrono::Utc::now().timestamp())
    }

    pub fn record_failure_at(&self, peer: &PeerId, now_secs: i64) -> bool {
        let mut state = self.state.lock().expect("failure tracker mutex poisoned");
        let entry = state.entry(peer.clone()).or_default();
        entry.consecutive += 1;
        if entry.consecutive >= self.threshold {
            entry.quarantined_until = now_secs + self.cooldown_secs;
            entry.consecutive = 0;
            debug!(peer = %peer, until = entry.quarantined_until, "peer quarantined");
            return true;
        }
        false
    }

    /// A success resets the consecutive-failure count.
    pub fn record_success(&self, peer: &PeerId) {
        let mut state = self.state.lock().expect("failure tracker mutex poisoned");
        if let Some(entry) = state.get_mut(peer) {
            entry.consecutive = 0;
        }
    }

    pub fn is_quarantined(&self, peer: &PeerId) -> bool {
        self.is_quarantined_at(peer, chrono::Utc::now().timestamp())
    }

    pub fn is_quarantined_at(&self, peer: &PeerId, now_secs: i64) -> bool {
        let state = self.state.lock().expect("failure tracker mutex poisoned");
        state.get(peer).is_some_and(|e| e.quarantined_until > now_secs)
    }
}
