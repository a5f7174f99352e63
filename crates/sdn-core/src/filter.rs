use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field-level filter operator. Tagged variants, no dynamic dispatch; the
/// core knows only this algebra and leaves payload decoding to the schema
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
}

impl FilterOp {
    /// Parse the wire/config spelling ("eq", "startsWith", …).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(FilterOp::Eq),
            "ne" => Some(FilterOp::Ne),
            "gt" => Some(FilterOp::Gt),
            "gte" => Some(FilterOp::Gte),
            "lt" => Some(FilterOp::Lt),
            "lte" => Some(FilterOp::Lte),
            "contains" => Some(FilterOp::Contains),
            "startsWith" => Some(FilterOp::StartsWith),
            "endsWith" => Some(FilterOp::EndsWith),
            "in" => Some(FilterOp::In),
            "notIn" => Some(FilterOp::NotIn),
            _ => None,
        }
    }
}

/// One field-level predicate. Sets of predicates combine with AND semantics
/// over a flat field space addressed by dotted paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Dotted path into the decoded payload, e.g. "INCLINATION" or "meta.source".
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self { field: field.into(), op, value }
    }

    /// Evaluate against a field value (`None` = field missing).
    ///
    /// A missing field evaluates false, except `ne`, which evaluates true —
    /// matching SQL nullability.
    pub fn eval(&self, field_value: Option<&Value>) -> bool {
        let value = match field_value {
            Some(v) => v,
            None => return self.op == FilterOp::Ne,
        };
        match self.op {
            FilterOp::Eq => json_eq(value, &self.value),
            FilterOp::Ne => !json_eq(value, &self.value),
            FilterOp::Gt => compare(value, &self.value).map(|o| o.is_gt()).unwrap_or(false),
            FilterOp::Gte => compare(value, &self.value).map(|o| o.is_ge()).unwrap_or(false),
            FilterOp::Lt => compare(value, &self.value).map(|o| o.is_lt()).unwrap_or(false),
            FilterOp::Lte => compare(value, &self.value).map(|o| o.is_le()).unwrap_or(false),
            FilterOp::Contains => match value {
                Value::String(s) => self.value.as_str().map(|n| s.contains(n)).unwrap_or(false),
                Value::Array(items) => items.iter().any(|i| json_eq(i, &self.value)),
                _ => false,
            },
            FilterOp::StartsWith => match (value.as_str(), self.value.as_str()) {
                (Some(s), Some(prefix)) => s.starts_with(prefix),
                _ => false,
            },
            FilterOp::EndsWith => match (value.as_str(), self.value.as_str()) {
                (Some(s), Some(suffix)) => s.ends_with(suffix),
                _ => false,
            },
            FilterOp::In => self
                .value
                .as_array()
                .map(|set| set.iter().any(|candidate| json_eq(value, candidate)))
                .unwrap_or(false),
            FilterOp::NotIn => self
                .value
                .as_array()
                .map(|set| !set.iter().any(|candidate| json_eq(value, candidate)))
                .unwrap_or(false),
        }
    }
}

/// JSON equality with numeric widening (`51` == `51.0`).
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Order numbers numerically and strings lexicographically; anything else is
/// incomparable.
fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparisons_widen() {
        let p = Predicate::new("INCLINATION", FilterOp::Gte, json!(50));
        assert!(p.eval(Some(&json!(51.6))));
        assert!(p.eval(Some(&json!(97.6))));
        assert!(!p.eval(Some(&json!(28.5))));
        assert!(Predicate::new("x", FilterOp::Eq, json!(51)).eval(Some(&json!(51.0))));
    }

    #[test]
    fn missing_field_is_false_except_ne() {
        assert!(!Predicate::new("x", FilterOp::Eq, json!(1)).eval(None));
        assert!(!Predicate::new("x", FilterOp::Gt, json!(1)).eval(None));
        assert!(!Predicate::new("x", FilterOp::In, json!([1])).eval(None));
        assert!(!Predicate::new("x", FilterOp::NotIn, json!([1])).eval(None));
        assert!(Predicate::new("x", FilterOp::Ne, json!(1)).eval(None));
    }

    #[test]
    fn string_operators() {
        let v = json!("1998-067A");
        assert!(Predicate::new("f", FilterOp::StartsWith, json!("1998")).eval(Some(&v)));
        assert!(Predicate::new("f", FilterOp::EndsWith, json!("067A")).eval(Some(&v)));
        assert!(Predicate::new("f", FilterOp::Contains, json!("-")).eval(Some(&v)));
        assert!(!Predicate::new("f", FilterOp::StartsWith, json!("2024")).eval(Some(&v)));
        assert!(Predicate::new("f", FilterOp::Gt, json!("1997")).eval(Some(&v)));
    }

    #[test]
    fn contains_over_arrays() {
        let v = json!(["LEO", "ISS"]);
        assert!(Predicate::new("tags", FilterOp::Contains, json!("ISS")).eval(Some(&v)));
        assert!(!Predicate::new("tags", FilterOp::Contains, json!("GEO")).eval(Some(&v)));
    }

    #[test]
    fn set_membership() {
        let p = Predicate::new("f", FilterOp::In, json!(["OMM", "CDM"]));
        assert!(p.eval(Some(&json!("OMM"))));
        assert!(!p.eval(Some(&json!("OEM"))));
        let n = Predicate::new("f", FilterOp::NotIn, json!(["OMM"]));
        assert!(n.eval(Some(&json!("OEM"))));
        assert!(!n.eval(Some(&json!("OMM"))));
    }

    #[test]
    fn incomparable_types_never_match_ordering() {
        assert!(!Predicate::new("f", FilterOp::Gt, json!("abc")).eval(Some(&json!(5))));
        assert!(!Predicate::new("f", FilterOp::Lte, json!(5)).eval(Some(&json!({"a": 1}))));
    }

    #[test]
    fn op_spellings_parse() {
        assert_eq!(FilterOp::parse("startsWith"), Some(FilterOp::StartsWith));
        assert_eq!(FilterOp::parse("notIn"), Some(FilterOp::NotIn));
        assert_eq!(FilterOp::parse("EQ"), None);
    }
}
