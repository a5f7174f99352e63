use std::collections::HashMap;
use std::sync::RwLock;

use sdn_core::{SdnError, EDGE_RELAY_TOPIC_SUFFIX, PNM_SCHEMA};

/// How a schema's payload bytes are checked.
///
/// The core treats payloads as opaque; the validator is a pure function of
/// `(descriptor, bytes)`. Built-in schemas carry JSON payloads whose
/// top-level fields the query planner and subscription filters can address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validator {
    /// Payload must parse as a JSON object; in strict mode the listed
    /// top-level fields must be present.
    JsonObject { required: Vec<&'static str> },
    /// Structural formats validated at decode time elsewhere (e.g. PNM
    /// envelopes); payload bytes are accepted as-is.
    Opaque,
}

/// Immutable schema descriptor: what `resolve` hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    pub name: &'static str,
    pub validator: Validator,
}

/// Validation strictness, from node configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Enforce required fields.
    Strict,
    /// Well-formedness only.
    Lenient,
}

/// Maps schema names to descriptors and canonical gossip topics.
///
/// Populated at startup from the embedded manifest; runtime additions are
/// permitted for custom schemas and persist for the process lifetime only.
pub struct SchemaRegistry {
    topic_prefix: String,
    mode: ValidationMode,
    schemas: RwLock<HashMap<String, SchemaDescriptor>>,
}

/// Built-in manifest: the standardized space-data schema set. Topic naming
/// for these is stable across releases; additions are additive.
fn builtin_manifest() -> HashMap<String, SchemaDescriptor> {
    fn json(name: &'static str, required: &[&'static str]) -> (String, SchemaDescriptor) {
        (
            name.to_string(),
            SchemaDescriptor { name, validator: Validator::JsonObject { required: required.to_vec() } },
        )
    }

    let mut m = HashMap::new();
    for (k, v) in [
        json("OMM", &["OBJECT_ID", "EPOCH"]),
        json("OEM", &["OBJECT_ID"]),
        json("CDM", &["TCA", "MISS_DISTANCE"]),
        json("CAT", &["OBJECT_ID"]),
        json("EPM", &[]),
        json("EOP", &[]),
        json("TDM", &[]),
        json("VCM", &["OBJECT_ID"]),
        json("LDM", &[]),
        json("TIM", &[]),
    ] {
        m.insert(k, v);
    }
    m.insert(
        PNM_SCHEMA.to_string(),
        SchemaDescriptor { name: "PNM", validator: Validator::Opaque },
    );
    m
}

impl SchemaRegistry {
    pub fn new(topic_prefix: impl Into<String>, mode: ValidationMode) -> Self {
        Self {
            topic_prefix: topic_prefix.into(),
            mode,
            schemas: RwLock::new(builtin_manifest()),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.schemas.read().expect("schema lock").contains_key(name)
    }

    /// Resolve a schema name to its descriptor.
    pub fn resolve(&self, name: &str) -> Result<SchemaDescriptor, SdnError> {
        self.schemas
            .read()
            .expect("schema lock")
            .get(name)
            .cloned()
            .ok_or_else(|| SdnError::UnknownSchema(name.to_string()))
    }

    /// All registered schema names, sorted (topic join order is stable).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.schemas.read().expect("schema lock").keys().cloned().collect();
        names.sort();
        names
    }

    /// Canonical gossip topic for a schema: `/<prefix>/sds/<SCHEMA>`.
    pub fn topic(&self, name: &str) -> String {
        format!("/{}/sds/{}", self.topic_prefix, name)
    }

    /// The PNM tip channel.
    pub fn pnm_topic(&self) -> String {
        self.topic(PNM_SCHEMA)
    }

    /// The relay announcement channel: `/<prefix>/edge-relays`.
    pub fn edge_relay_topic(&self) -> String {
        format!("/{}/{}", self.topic_prefix, EDGE_RELAY_TOPIC_SUFFIX)
    }

    /// Register a custom schema at runtime (process lifetime only).
    /// Returns `AlreadyExists` when the name is taken.
    pub fn register_custom(
        &self,
        name: &'static str,
        required: Vec<&'static str>,
    ) -> Result<(), SdnError> {
        let mut schemas = self.schemas.write().expect("schema lock");
        if schemas.contains_key(name) {
            return Err(SdnError::AlreadyExists(name.to_string()));
        }
        schemas.insert(
            name.to_string(),
            SchemaDescriptor { name, validator: Validator::JsonObject { required } },
        );
        Ok(())
    }

    /// Validate payload bytes against a named schema.
    pub fn validate(&self, name: &str, payload: &[u8]) -> Result<(), SdnError> {
        let descriptor = self.resolve(name)?;
        match &descriptor.validator {
            Validator::Opaque => Ok(()),
            Validator::JsonObject { required } => {
                let value: serde_json::Value = serde_json::from_slice(payload)
                    .map_err(|e| SdnError::SchemaValidationFailed(format!("{name}: {e}")))?;
                let obj = value.as_object().ok_or_else(|| {
                    SdnError::SchemaValidationFailed(format!("{name}: payload is not an object"))
                })?;
                if self.mode == ValidationMode::Strict {
                    for field in required {
                        if !obj.contains_key(*field) {
                            return Err(SdnError::SchemaValidationFailed(format!(
                                "{name}: missing required field {field}"
                            )));
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

/// Dotted-path getter over a decoded payload, the seam to the external
/// schema library. The built-in implementation reads JSON objects.
pub trait PayloadFields: Send + Sync {
    /// Decode `payload` for `schema` and return the value at `path`
    /// (`a.b.c` addresses nested objects). `None` for missing fields or
    /// undecodable payloads.
    fn get(&self, schema: &str, payload: &[u8], path: &str) -> Option<serde_json::Value>;
}

/// JSON object field access for the built-in manifest.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFields;

impl PayloadFields for JsonFields {
    fn get(&self, _schema: &str, payload: &[u8], path: &str) -> Option<serde_json::Value> {
        let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
        lookup_path(&value, path).cloned()
    }
}

/// Walk a dotted path through nested JSON objects.
pub fn lookup_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new("spacedata", ValidationMode::Strict)
    }

    #[test]
    fn resolves_builtin_schemas() {
        let reg = registry();
        assert!(reg.has("OMM"));
        assert!(reg.has("CDM"));
        assert!(reg.has("PNM"));
        assert!(!reg.has("NOPE"));
        assert!(matches!(reg.resolve("NOPE"), Err(SdnError::UnknownSchema(_))));
    }

    #[test]
    fn topic_naming_is_stable() {
        let reg = registry();
        assert_eq!(reg.topic("OMM"), "/spacedata/sds/OMM");
        assert_eq!(reg.pnm_topic(), "/spacedata/sds/PNM");
        assert_eq!(reg.edge_relay_topic(), "/spacedata/edge-relays");
    }

    #[test]
    fn strict_validation_enforces_required_fields() {
        let reg = registry();
        let ok = br#"{"OBJECT_ID":"1998-067A","EPOCH":"2024-01-15T12:00:00Z","INCLINATION":51.6}"#;
        reg.validate("OMM", ok).unwrap();

        let missing = br#"{"OBJECT_ID":"1998-067A"}"#;
        assert!(matches!(
            reg.validate("OMM", missing),
            Err(SdnError::SchemaValidationFailed(_))
        ));

        let not_json = b"\x00\x01\x02";
        assert!(reg.validate("OMM", not_json).is_err());
    }

    #[test]
    fn lenient_mode_only_checks_shape() {
        let reg = SchemaRegistry::new("spacedata", ValidationMode::Lenient);
        reg.validate("OMM", br#"{"anything":1}"#).unwrap();
        assert!(reg.validate("OMM", br#"[1,2,3]"#).is_err());
    }

    #[test]
    fn custom_schema_registers_once() {
        let reg = registry();
        reg.register_custom("XSIM", vec!["RUN_ID"]).unwrap();
        assert!(reg.has("XSIM"));
        reg.validate("XSIM", br#"{"RUN_ID":"r1"}"#).unwrap();
        assert!(matches!(
            reg.register_custom("XSIM", vec![]),
            Err(SdnError::AlreadyExists(_))
        ));
    }

    #[test]
    fn dotted_path_lookup() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"a":{"b":{"c":42}},"top":"x"}"#).unwrap();
        assert_eq!(lookup_path(&v, "a.b.c").unwrap(), &serde_json::json!(42));
        assert_eq!(lookup_path(&v, "top").unwrap(), &serde_json::json!("x"));
        assert!(lookup_path(&v, "a.missing").is_none());
        assert!(lookup_path(&v, "a.b.c.d").is_none());
    }
}
