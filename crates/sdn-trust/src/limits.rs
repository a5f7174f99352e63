use std::collections::HashMap;
use std::sync::Mutex;

use sdn_core::{SdnError, TrustLevel};

/// Per-trust-level protocol caps enforced by the exchange handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustLimits {
    pub requests_per_min: u32,
    pub max_inflight_streams: u32,
    pub max_response_bytes: usize,
}

/// Default trust-level-to-rate-limit map; overridable from configuration.
pub fn default_limits(level: TrustLevel) -> TrustLimits {
    match level {
        TrustLevel::Untrusted => TrustLimits {
            requests_per_min: 10,
            max_inflight_streams: 4,
            max_response_bytes: 1024 * 1024,
        },
        TrustLevel::Limited => TrustLimits {
            requests_per_min: 30,
            max_inflight_streams: 8,
            max_response_bytes: 5 * 1024 * 1024,
        },
        TrustLevel::Standard => TrustLimits {
            requests_per_min: 120,
            max_inflight_streams: 32,
            max_response_bytes: 10 * 1024 * 1024,
        },
        TrustLevel::Trusted => TrustLimits {
            requests_per_min: 600,
            max_inflight_streams: 128,
            max_response_bytes: 10 * 1024 * 1024,
        },
        TrustLevel::Admin => TrustLimits {
            requests_per_min: u32::MAX,
            max_inflight_streams: 256,
            max_response_bytes: 10 * 1024 * 1024,
        },
    }
}

/// One-minute fixed-window token bucket.
///
/// The window is anchored to wall-clock minutes, so the first event of a new
/// window is always accepted.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    capacity_per_min: u32,
    window: i64,
    used: u32,
}

impl TokenBucket {
    pub fn new(capacity_per_min: u32) -> Self {
        Self { capacity_per_min, window: -1, used: 0 }
    }

    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(chrono::Utc::now().timestamp())
    }

    /// Consume one token at `now` (epoch seconds). False when the window is
    /// exhausted.
    pub fn try_consume_at(&mut self, now_secs: i64) -> bool {
        let window = now_secs.div_euclid(60);
        if window != self.window {
            self.window = window;
            self.used = 0;
        }
        if self.used >= self.capacity_per_min {
            return false;
        }
        self.used += 1;
        true
    }
}

/// Size-bounded table of fixed-window counters keyed by an arbitrary string
/// (peer id, IP, xpub). The mutex is never held across I/O.
///
/// When the table exceeds `max_entries`, expired windows are compacted; if
/// the table is still full, the new caller is denied rather than grow the
/// table without bound.
pub struct RateTable {
    max_entries: usize,
    entries: Mutex<HashMap<String, WindowEntry>>,
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    window: i64,
    count: u32,
}

impl RateTable {
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries, entries: Mutex::new(HashMap::new()) }
    }

    pub fn check(&self, key: &str, limit: u32) -> Result<(), SdnError> {
        self.check_at(key, limit, chrono::Utc::now().timestamp())
    }

    /// Count one event for `key` at `now`; `RateLimited` when the per-minute
    /// limit is exceeded or the table cannot admit the key.
    pub fn check_at(&self, key: &str, limit: u32, now_secs: i64) -> Result<(), SdnError> {
        let window = now_secs.div_euclid(60);
        let mut entries = self.entries.lock().expect("rate table mutex poisoned");

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            entries.retain(|_, e| e.window == window);
            if entries.len() >= self.max_entries {
                return Err(SdnError::RateLimited);
            }
        }

        let entry = entries.entry(key.to_string()).or_insert(WindowEntry { window, count: 0 });
        if entry.window != window {
            entry.window = window;
            entry.count = 0;
        }
        if entry.count >= limit {
            return Err(SdnError::RateLimited);
        }
        entry.count += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("rate table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_enforces_per_minute_quota() {
        let mut bucket = TokenBucket::new(3);
        let t0 = 600; // minute boundary
        assert!(bucket.try_consume_at(t0));
        assert!(bucket.try_consume_at(t0 + 1));
        assert!(bucket.try_consume_at(t0 + 2));
        assert!(!bucket.try_consume_at(t0 + 3));
    }

    #[test]
    fn first_event_of_new_window_is_accepted() {
        let mut bucket = TokenBucket::new(1);
        assert!(bucket.try_consume_at(600));
        assert!(!bucket.try_consume_at(659));
        // Exactly at the window edge: new minute, fresh quota.
        assert!(bucket.try_consume_at(660));
    }

    #[test]
    fn rate_table_limits_per_key() {
        let table = RateTable::new(100);
        for _ in 0..5 {
            table.check_at("ip:1.2.3.4", 5, 600).unwrap();
        }
        assert!(matches!(table.check_at("ip:1.2.3.4", 5, 601), Err(SdnError::RateLimited)));
        // Other keys are unaffected.
        table.check_at("ip:5.6.7.8", 5, 601).unwrap();
    }

    #[test]
    fn rate_table_compacts_expired_entries_when_full() {
        let table = RateTable::new(2);
        table.check_at("a", 10, 0).unwrap();
        table.check_at("b", 10, 0).unwrap();
        // Table full of minute-0 entries; a minute-1 caller triggers compaction.
        table.check_at("c", 10, 60).unwrap();
        assert!(table.len() <= 2);
    }

    #[test]
    fn rate_table_denies_when_still_full_after_compaction() {
        let table = RateTable::new(2);
        table.check_at("a", 10, 60).unwrap();
        table.check_at("b", 10, 60).unwrap();
        // Same window: nothing to compact, third key denied.
        assert!(matches!(table.check_at("c", 10, 61), Err(SdnError::RateLimited)));
    }
}
