//! Compiles JSON-Schema documents into [`IrNode`] pools, content-addressed
//! by the schema's canonical bytes so that `compile(schema)` is idempotent
//! (spec.md §8).

use crate::error::{Result, SchemaError};
use crate::ir::{Additional, IrId, IrNode, JsonType};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// The interned pool of compiled schema nodes.
#[derive(Default)]
pub struct SchemaIr {
    nodes: Vec<IrNode>,
    patterns: Vec<Regex>,
    by_schema_hash: HashMap<blake3::Hash, IrId>,
}

fn canonical_bytes(value: &Value) -> Vec<u8> {
    // serde_json's `preserve_order` feature (workspace-wide) keeps object
    // key order as encountered in source; re-sort recursively so two
    // differently-ordered-but-equal schemas hash identically.
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), sorted(v))).collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                Value::Object(entries.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_vec(&sorted(value)).expect("json schema always serializes")
}

impl SchemaIr {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node at `id`.
    pub fn node(&self, id: IrId) -> &IrNode {
        &self.nodes[id as usize]
    }

    /// Returns the compiled regex backing `Pattern(idx)`.
    pub fn pattern(&self, idx: usize) -> &Regex {
        &self.patterns[idx]
    }

    /// The schema `default` annotated onto `id`, if any (spec.md §4.7).
    pub fn default_for(&self, id: IrId) -> Option<&Value> {
        match &self.nodes[id as usize] {
            IrNode::Annotated { default, .. } => default.as_ref(),
            _ => None,
        }
    }

    /// True if `id` carries `asCell: true`.
    pub fn is_as_cell(&self, id: IrId) -> bool {
        matches!(&self.nodes[id as usize], IrNode::Annotated { as_cell: true, .. })
    }

    /// True if `id` carries `asStream: true`.
    pub fn is_as_stream(&self, id: IrId) -> bool {
        matches!(&self.nodes[id as usize], IrNode::Annotated { as_stream: true, .. })
    }

    /// Compiles `schema` against itself as root (no external `$defs`),
    /// returning the id of its top-level node. Compiling the same schema
    /// bytes twice returns the same id without recompiling.
    pub fn compile(&mut self, schema: &Value) -> Result<IrId> {
        let hash = blake3::hash(&canonical_bytes(schema));
        if let Some(&id) = self.by_schema_hash.get(&hash) {
            return Ok(id);
        }
        let mut ref_cache = HashMap::new();
        let id = self.compile_node(schema, schema, &mut ref_cache)?;
        self.by_schema_hash.insert(hash, id);
        Ok(id)
    }

    fn alloc(&mut self, node: IrNode) -> IrId {
        self.nodes.push(node);
        (self.nodes.len() - 1) as IrId
    }

    /// Compiles `schema`, wrapping the result in [`IrNode::Annotated`] when
    /// `default`/`asCell`/`asStream` are present alongside the rest of the
    /// keywords (spec.md §4.7).
    fn compile_node(&mut self, schema: &Value, root: &Value, ref_cache: &mut HashMap<String, IrId>) -> Result<IrId> {
        if let Value::Object(obj) = schema {
            let default = obj.get("default").cloned();
            let as_cell = obj.get("asCell").and_then(Value::as_bool).unwrap_or(false);
            let as_stream = obj.get("asStream").and_then(Value::as_bool).unwrap_or(false);
            if default.is_some() || as_cell || as_stream {
                let inner = self.compile_node_inner(schema, root, ref_cache)?;
                return Ok(self.alloc(IrNode::Annotated { inner, default, as_cell, as_stream }));
            }
        }
        self.compile_node_inner(schema, root, ref_cache)
    }

    fn compile_node_inner(&mut self, schema: &Value, root: &Value, ref_cache: &mut HashMap<String, IrId>) -> Result<IrId> {
        match schema {
            Value::Bool(true) => Ok(self.alloc(IrNode::Any)),
            Value::Bool(false) => Ok(self.alloc(IrNode::Never)),
            Value::Object(obj) => {
                if let Some(Value::String(ptr)) = obj.get("$ref") {
                    return self.compile_ref(ptr, root, ref_cache);
                }
                if let Some(Value::Array(all_of)) = obj.get("allOf") {
                    let ids = all_of
                        .iter()
                        .map(|s| self.compile_node(s, root, ref_cache))
                        .collect::<Result<Vec<_>>>()?;
                    return Ok(self.alloc(IrNode::AllOf(ids)));
                }
                if let Some(Value::Array(any_of)) = obj.get("anyOf") {
                    let ids = any_of
                        .iter()
                        .map(|s| self.compile_node(s, root, ref_cache))
                        .collect::<Result<Vec<_>>>()?;
                    return Ok(self.alloc(IrNode::AnyOf(ids)));
                }
                if let Some(v) = obj.get("const") {
                    return Ok(self.alloc(IrNode::Const(v.clone())));
                }
                if let Some(Value::Array(vs)) = obj.get("enum") {
                    return Ok(self.alloc(IrNode::Enum(vs.clone())));
                }
                if let Some(Value::String(pat)) = obj.get("pattern") {
                    let regex = Regex::new(pat).map_err(|e| SchemaError::InvalidPattern(pat.clone(), e.to_string()))?;
                    let idx = self.patterns.len();
                    self.patterns.push(regex);
                    return Ok(self.alloc(IrNode::Pattern(idx)));
                }
                if obj.contains_key("minimum")
                    || obj.contains_key("maximum")
                    || obj.contains_key("exclusiveMinimum")
                    || obj.contains_key("exclusiveMaximum")
                {
                    return Ok(self.alloc(IrNode::Range {
                        minimum: obj.get("minimum").and_then(Value::as_f64),
                        maximum: obj.get("maximum").and_then(Value::as_f64),
                        exclusive_minimum: obj.get("exclusiveMinimum").map(|v| v.as_bool().unwrap_or(false)).unwrap_or(false),
                        exclusive_maximum: obj.get("exclusiveMaximum").map(|v| v.as_bool().unwrap_or(false)).unwrap_or(false),
                    }));
                }
                if let Some(Value::Object(props)) = obj.get("properties") {
                    let required: Vec<String> = obj
                        .get("required")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                        .unwrap_or_default();
                    let labels: Vec<String> = obj
                        .get("ifc.classification")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                        .unwrap_or_default();
                    let mut properties = Vec::with_capacity(props.len());
                    for (key, sub) in props {
                        let id = self.compile_node(sub, root, ref_cache)?;
                        properties.push((key.clone(), id));
                    }
                    let additional = match obj.get("additionalProperties") {
                        None => Additional::Omit,
                        Some(Value::Bool(true)) => Additional::Allow,
                        Some(Value::Bool(false)) => Additional::Deny,
                        Some(sub) => Additional::Schema(self.compile_node(sub, root, ref_cache)?),
                    };
                    return Ok(self.alloc(IrNode::Props {
                        required,
                        properties,
                        additional,
                        labels,
                    }));
                }
                if let Some(Value::Array(tuple)) = obj.get("items") {
                    let ids = tuple
                        .iter()
                        .map(|s| self.compile_node(s, root, ref_cache))
                        .collect::<Result<Vec<_>>>()?;
                    return Ok(self.alloc(IrNode::ItemsTuple { items: ids }));
                }
                if let Some(item) = obj.get("items") {
                    let id = self.compile_node(item, root, ref_cache)?;
                    return Ok(self.alloc(IrNode::ItemsEach { item: id }));
                }
                if let Some(Value::String(ty)) = obj.get("type") {
                    let jt = JsonType::from_name(ty).ok_or_else(|| SchemaError::UnknownType(ty.clone()))?;
                    return Ok(self.alloc(IrNode::TypeCheck(jt)));
                }
                Ok(self.alloc(IrNode::Any))
            }
            other => Err(SchemaError::NotASchema(other.clone())),
        }
    }

    fn compile_ref(&mut self, pointer: &str, root: &Value, ref_cache: &mut HashMap<String, IrId>) -> Result<IrId> {
        if let Some(&id) = ref_cache.get(pointer) {
            return Ok(id);
        }
        let placeholder = self.alloc(IrNode::Ref(IrId::MAX));
        ref_cache.insert(pointer.to_string(), placeholder);
        let target = resolve_pointer(root, pointer).ok_or_else(|| SchemaError::DanglingRef(pointer.to_string()))?;
        let resolved = self.compile_node(&target, root, ref_cache)?;
        self.nodes[placeholder as usize] = IrNode::Ref(resolved);
        Ok(placeholder)
    }
}

fn resolve_pointer(root: &Value, pointer: &str) -> Option<Value> {
    let pointer = pointer.strip_prefix('#').unwrap_or(pointer);
    if pointer.is_empty() {
        return Some(root.clone());
    }
    let mut cur = root;
    for seg in pointer.trim_start_matches('/').split('/') {
        let seg = seg.replace("~1", "/").replace("~0", "~");
        cur = cur.get(&seg)?;
    }
    Some(cur.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_is_idempotent() {
        let mut ir = SchemaIr::new();
        let schema = serde_json::json!({"type": "string"});
        let a = ir.compile(&schema).unwrap();
        let b = ir.compile(&schema).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn compiles_object_with_required_and_nested_props() {
        let mut ir = SchemaIr::new();
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"],
        });
        let id = ir.compile(&schema).unwrap();
        match ir.node(id) {
            IrNode::Props { required, properties, .. } => {
                assert_eq!(required, &vec!["name".to_string()]);
                assert_eq!(properties.len(), 1);
            }
            other => panic!("expected Props, got {other:?}"),
        }
    }

    #[test]
    fn cyclic_ref_compiles_without_recursing_forever() {
        let mut ir = SchemaIr::new();
        let schema = serde_json::json!({
            "$defs": {
                "node": {
                    "type": "object",
                    "properties": {
                        "next": {"$ref": "#/$defs/node"}
                    }
                }
            },
            "$ref": "#/$defs/node"
        });
        let id = ir.compile(&schema).unwrap();
        // top-level is itself a $ref; its aliasee should be a Props node.
        let resolved = match ir.node(id) {
            IrNode::Ref(target) => *target,
            other => panic!("expected Ref, got {other:?}"),
        };
        assert!(matches!(ir.node(resolved), IrNode::Props { .. }));
    }

    #[test]
    fn default_as_cell_as_stream_compile_to_an_annotated_wrapper() {
        let mut ir = SchemaIr::new();
        let schema = serde_json::json!({
            "type": "number",
            "default": 42,
            "asCell": true,
        });
        let id = ir.compile(&schema).unwrap();
        match ir.node(id) {
            IrNode::Annotated { inner, default, as_cell, as_stream } => {
                assert_eq!(default.as_ref(), Some(&serde_json::json!(42)));
                assert!(*as_cell);
                assert!(!*as_stream);
                assert!(matches!(ir.node(*inner), IrNode::TypeCheck(JsonType::Number)));
            }
            other => panic!("expected Annotated, got {other:?}"),
        }
        assert_eq!(ir.default_for(id), Some(&serde_json::json!(42)));
        assert!(ir.is_as_cell(id));
        assert!(!ir.is_as_stream(id));
    }

    #[test]
    fn schema_without_annotations_compiles_without_a_wrapper() {
        let mut ir = SchemaIr::new();
        let id = ir.compile(&serde_json::json!({"type": "string"})).unwrap();
        assert!(matches!(ir.node(id), IrNode::TypeCheck(JsonType::String)));
        assert_eq!(ir.default_for(id), None);
    }
}
