//! Recipe shapes, serialized input to the runner (spec.md §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A compiled computational graph: a flat list of node instantiations
/// plus the argument/result schemas and defaulted internal state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    pub argument_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<InitialState>,
    pub nodes: Vec<Node>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InitialState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<Value>,
}

/// One node instantiation: a module bound to input/output binding
/// trees (plain JSON with embedded links, see `common-path::Link`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub module: Module,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub outputs: Value,
}

/// The five module kinds the runner instantiates (spec.md §4.9 step 4).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Module {
    Javascript {
        argument_schema: Value,
        result_schema: Value,
        implementation: ImplementationRef,
    },
    Recipe {
        implementation: Box<Recipe>,
    },
    Raw {
        implementation: String,
    },
    Passthrough,
    Ref {
        #[serde(rename = "ref")]
        reference: String,
    },
}

/// A reference to a harness-compiled function body. The runner never
/// executes source text itself; it resolves this to a cached
/// [`crate::JsFunction`] by fingerprint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImplementationRef {
    Source(String),
    Fingerprint { fingerprint: String },
}

impl ImplementationRef {
    /// Stable content fingerprint used as the function cache key.
    pub fn fingerprint(&self) -> String {
        match self {
            ImplementationRef::Source(src) => blake3::hash(src.as_bytes()).to_hex().to_string(),
            ImplementationRef::Fingerprint { fingerprint } => fingerprint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_tag_round_trips_through_json() {
        let m = Module::Passthrough;
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["type"], "passthrough");
        let back: Module = serde_json::from_value(v).unwrap();
        assert!(matches!(back, Module::Passthrough));
    }

    #[test]
    fn ref_module_keeps_ref_field_name() {
        let m = Module::Ref { reference: "shared:mapper".into() };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["ref"], "shared:mapper");
    }

    #[test]
    fn same_source_yields_same_fingerprint() {
        let a = ImplementationRef::Source("x => x + 1".into());
        let b = ImplementationRef::Source("x => x + 1".into());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
