//! ID-based entity identity for array elements (spec.md §4.7, §9 open
//! question).
//!
//! When an object pushed or set into an array carries [`ID_FIELD`], its
//! entity identity is derived from that id rather than from its full
//! content, so that reordering or editing the element in place doesn't
//! mint a new entity. Reuse is scoped to the *immediate* array context
//! only (decided in DESIGN.md): a sibling match is looked up against the
//! elements already seen at the same array path in the same `set`/`push`
//! call, never across unrelated arrays or nested sub-arrays.

use common_path::Entity;
use serde_json::Value;
use std::collections::HashMap;

/// The sibling-identity field name. Not specified by spec.md; `$id` is
/// chosen as the wire key (documented as an open-question decision).
pub const ID_FIELD: &str = "$id";

/// Tracks `(array path) -> (id value -> entity)` for one `set`/`push`
/// call, so array elements within that single call reuse identity.
#[derive(Default)]
pub struct ArrayIdentityScope {
    seen: HashMap<(String, String), Entity>,
}

impl ArrayIdentityScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the entity identity for `item` at `array_path`, reusing a
    /// prior element's entity if one with the same `ID_FIELD` value was
    /// already seen at this exact array path in this scope.
    pub fn resolve(&mut self, array_path: &str, item: &Value) -> Option<Entity> {
        let id_value = item.get(ID_FIELD)?;
        let id_key = id_value.to_string();
        let key = (array_path.to_string(), id_key);
        if let Some(existing) = self.seen.get(&key) {
            return Some(existing.clone());
        }
        let seed = format!("{array_path}\0{}", key.1);
        let entity = Entity::derive(seed.as_bytes());
        self.seen.insert(key, entity.clone());
        Some(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_id_at_same_path_reuses_entity() {
        let mut scope = ArrayIdentityScope::new();
        let a = scope.resolve("/todos", &serde_json::json!({"$id": "b", "v": 1})).unwrap();
        let b = scope.resolve("/todos", &serde_json::json!({"$id": "b", "v": 2})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_ids_yield_different_entities() {
        let mut scope = ArrayIdentityScope::new();
        let a = scope.resolve("/todos", &serde_json::json!({"$id": "a"})).unwrap();
        let b = scope.resolve("/todos", &serde_json::json!({"$id": "b"})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn same_id_at_different_array_path_is_a_different_entity() {
        let mut scope = ArrayIdentityScope::new();
        let a = scope.resolve("/todos", &serde_json::json!({"$id": "x"})).unwrap();
        let b = scope.resolve("/other", &serde_json::json!({"$id": "x"})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn item_without_id_field_is_not_identity_tracked() {
        let mut scope = ArrayIdentityScope::new();
        assert!(scope.resolve("/todos", &serde_json::json!({"v": 1})).is_none());
    }
}
