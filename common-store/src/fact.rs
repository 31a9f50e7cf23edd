//! Facts: immutable assertions forming a per-(space, entity, attribute)
//! hash-linked lineage (spec.md §3).

use crate::Digest;
use common_path::Entity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A mime-type-like attribute tag. Commonly `application/json` or
/// `application/label+json`.
pub type Attribute = String;

/// The well-known JSON-document attribute.
pub const ATTR_JSON: &str = "application/json";
/// The well-known classification-label attribute.
pub const ATTR_LABEL: &str = "application/label+json";

/// An immutable assertion `{the, of, is, cause}`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// The attribute being asserted.
    pub the: Attribute,
    /// The entity the attribute belongs to.
    pub of: Entity,
    /// The asserted value.
    pub is: Value,
    /// The digest of the prior fact in this (space, entity, attribute)
    /// lineage, or `None` for the first assertion.
    pub cause: Option<Digest>,
}

impl Fact {
    /// Builds a new fact.
    pub fn new(the: impl Into<Attribute>, of: Entity, is: Value, cause: Option<Digest>) -> Self {
        Self {
            the: the.into(),
            of,
            is,
            cause,
        }
    }

    /// Canonical bytes whose hash is this fact's identity. Object keys are
    /// sorted so that two logically identical facts always hash equal,
    /// independent of field insertion order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let canonical = canonicalize(&serde_json::json!({
            "the": self.the,
            "of": self.of.as_str(),
            "is": self.is,
            "cause": self.cause.map(|d| d.to_hex()),
        }));
        serde_json::to_vec(&canonical).expect("canonical fact always serializes")
    }

    /// This fact's content-addressed identity.
    pub fn digest(&self) -> Digest {
        Digest::of(&self.canonical_bytes())
    }
}

/// Recursively sorts object keys so that serialization is deterministic.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_under_key_reordering() {
        let a = Fact::new(ATTR_JSON, Entity::new("of:a"), serde_json::json!({"a": 1, "b": 2}), None);
        let b = Fact::new(ATTR_JSON, Entity::new("of:a"), serde_json::json!({"b": 2, "a": 1}), None);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn digest_changes_with_cause() {
        let a = Fact::new(ATTR_JSON, Entity::new("of:a"), serde_json::json!(1), None);
        let b = Fact::new(ATTR_JSON, Entity::new("of:a"), serde_json::json!(1), Some(a.digest()));
        assert_ne!(a.digest(), b.digest());
    }
}
