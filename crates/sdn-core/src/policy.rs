use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::PeerId;

/// One level of the policy hierarchy. `None` fields fall through to the next
/// level during resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub auto_fetch: Option<bool>,
    pub auto_pin: Option<bool>,
    pub ttl_secs: Option<u64>,
    pub priority: Option<u8>,
    pub trusted: Option<bool>,
    pub fetch_timeout_secs: Option<u64>,
}

/// Per-source overrides, optionally refined per schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePolicy {
    #[serde(flatten)]
    pub entry: PolicyEntry,
    #[serde(default)]
    pub schema_overrides: HashMap<String, PolicyEntry>,
}

/// The complete system default: every field concrete, so resolution always
/// terminates with a full `ResolvedPolicy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDefaults {
    pub auto_fetch: bool,
    pub auto_pin: bool,
    pub ttl_secs: u64,
    pub priority: u8,
    pub trusted: bool,
    pub fetch_timeout_secs: u64,
}

impl Default for SystemDefaults {
    fn default() -> Self {
        Self {
            auto_fetch: false,
            auto_pin: false,
            ttl_secs: 3600,
            priority: 0,
            trusted: false,
            fetch_timeout_secs: 30,
        }
    }
}

/// Four-level policy hierarchy consulted to decide the fate of an arriving
/// PNM. Priority order:
///
///   1. source override, schema-specific
///   2. source override
///   3. schema default
///   4. system default
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub system: SystemDefaults,
    #[serde(default)]
    pub schema_defaults: HashMap<String, PolicyEntry>,
    #[serde(default)]
    pub source_overrides: HashMap<PeerId, SourcePolicy>,
}

/// The outcome of policy resolution: always complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPolicy {
    pub auto_fetch: bool,
    pub auto_pin: bool,
    pub ttl_secs: u64,
    pub priority: u8,
    pub trusted: bool,
    pub fetch_timeout_secs: u64,
}

impl PolicyConfig {
    /// Resolve the effective policy for a `(producer, schema)` pair.
    ///
    /// Each field independently takes the value of the highest-priority level
    /// that specifies it. Deterministic for any given config.
    pub fn resolve(&self, producer: &PeerId, schema: &str) -> ResolvedPolicy {
        let source = self.source_overrides.get(producer);
        let source_schema = source.and_then(|s| s.schema_overrides.get(schema));
        let source_entry = source.map(|s| &s.entry);
        let schema_default = self.schema_defaults.get(schema);

        let chain = [source_schema, source_entry, schema_default];

        let pick_bool = |get: fn(&PolicyEntry) -> Option<bool>, fallback: bool| {
            chain.iter().flatten().find_map(|e| get(e)).unwrap_or(fallback)
        };
        let pick_u64 = |get: fn(&PolicyEntry) -> Option<u64>, fallback: u64| {
            chain.iter().flatten().find_map(|e| get(e)).unwrap_or(fallback)
        };
        let pick_u8 = |get: fn(&PolicyEntry) -> Option<u8>, fallback: u8| {
            chain.iter().flatten().find_map(|e| get(e)).unwrap_or(fallback)
        };

        ResolvedPolicy {
            auto_fetch: pick_bool(|e| e.auto_fetch, self.system.auto_fetch),
            auto_pin: pick_bool(|e| e.auto_pin, self.system.auto_pin),
            ttl_secs: pick_u64(|e| e.ttl_secs, self.system.ttl_secs),
            priority: pick_u8(|e| e.priority, self.system.priority),
            trusted: pick_bool(|e| e.trusted, self.system.trusted),
            fetch_timeout_secs: pick_u64(|e| e.fetch_timeout_secs, self.system.fetch_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::new(s)
    }

    fn config_with_omm_defaults() -> PolicyConfig {
        let mut cfg = PolicyConfig::default();
        cfg.schema_defaults.insert(
            "OMM".into(),
            PolicyEntry {
                auto_fetch: Some(true),
                auto_pin: Some(true),
                ttl_secs: Some(12 * 3600),
                priority: Some(5),
                ..Default::default()
            },
        );
        cfg
    }

    #[test]
    fn system_default_applies_when_nothing_else_matches() {
        let cfg = PolicyConfig::default();
        let r = cfg.resolve(&peer("QmUnknown"), "CDM");
        assert!(!r.auto_fetch);
        assert!(!r.auto_pin);
        assert_eq!(r.ttl_secs, 3600);
        assert_eq!(r.priority, 0);
    }

    #[test]
    fn schema_default_overrides_system() {
        let cfg = config_with_omm_defaults();
        let r = cfg.resolve(&peer("QmUnknown"), "OMM");
        assert!(r.auto_fetch);
        assert!(r.auto_pin);
        assert_eq!(r.ttl_secs, 12 * 3600);
        assert_eq!(r.priority, 5);
    }

    #[test]
    fn source_override_fills_only_its_fields() {
        // Source override sets trusted only; everything else falls through to
        // the schema default for OMM, and to a different schema default for CDM.
        let mut cfg = config_with_omm_defaults();
        cfg.schema_defaults.insert(
            "CDM".into(),
            PolicyEntry {
                auto_fetch: Some(true),
                auto_pin: Some(true),
                ttl_secs: Some(48 * 3600),
                priority: Some(10),
                ..Default::default()
            },
        );
        cfg.source_overrides.insert(
            peer("QmProducer"),
            SourcePolicy {
                entry: PolicyEntry { trusted: Some(true), ..Default::default() },
                schema_overrides: HashMap::new(),
            },
        );

        let omm = cfg.resolve(&peer("QmProducer"), "OMM");
        assert!(omm.trusted);
        assert!(omm.auto_fetch);
        assert_eq!(omm.ttl_secs, 12 * 3600);
        assert_eq!(omm.priority, 5);

        let cdm = cfg.resolve(&peer("QmProducer"), "CDM");
        assert!(cdm.trusted);
        assert_eq!(cdm.ttl_secs, 48 * 3600);
        assert_eq!(cdm.priority, 10);
    }

    #[test]
    fn source_schema_override_wins_over_everything() {
        let mut cfg = config_with_omm_defaults();
        let mut overrides = HashMap::new();
        overrides.insert(
            "OMM".into(),
            PolicyEntry { auto_fetch: Some(false), priority: Some(200), ..Default::default() },
        );
        cfg.source_overrides.insert(
            peer("QmProducer"),
            SourcePolicy {
                entry: PolicyEntry { auto_fetch: Some(true), ..Default::default() },
                schema_overrides: overrides,
            },
        );

        let r = cfg.resolve(&peer("QmProducer"), "OMM");
        assert!(!r.auto_fetch, "source+schema level outranks source level");
        assert_eq!(r.priority, 200);
        // Unset at the two source levels: falls to the schema default.
        assert!(r.auto_pin);
    }

    #[test]
    fn resolution_is_deterministic() {
        let cfg = config_with_omm_defaults();
        let a = cfg.resolve(&peer("QmX"), "OMM");
        let b = cfg.resolve(&peer("QmX"), "OMM");
        assert_eq!(a, b);
    }
}
