//! Minimal-diff write computation between an old and new JSON value
//! (spec.md §4.7 `set`: "emits minimum-diff facts... for array shrinkage,
//! emits explicit index deletions plus length").

use common_branch::WriteOp;
use common_path::{Link, PathBuf, Token};
use serde_json::Value;

/// Computes the smallest set of [`WriteOp`]s that transform `old` into
/// `new`, rooted at `path`. Deletes array tail elements highest-index
/// first so each removal's index is still valid against the
/// not-yet-shrunk array (the `length` automerge tracks internally has no
/// counterpart in this plain-JSON representation: an array's length is
/// simply its element count, so no separate length write is needed once
/// every stale index is deleted).
pub fn diff_ops(old: &Value, new: &Value, path: &PathBuf) -> Vec<WriteOp> {
    let mut ops = Vec::new();
    diff_into(old, new, path, &mut ops);
    ops
}

fn diff_into(old: &Value, new: &Value, path: &PathBuf, ops: &mut Vec<WriteOp>) {
    if old == new {
        return;
    }
    // A link is an atomic pointer, not a structured value: if either side
    // is link-shaped, a change is "points somewhere else now", never a
    // field-level edit of the link envelope itself.
    if Link::from_json(old).is_some() || Link::from_json(new).is_some() {
        ops.push(WriteOp::Set {
            path: path.clone(),
            value: new.clone(),
        });
        return;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, new_val) in new_map {
                let child_path = path.child(Token::field(key.clone()));
                match old_map.get(key) {
                    Some(old_val) => diff_into(old_val, new_val, &child_path, ops),
                    None => ops.push(WriteOp::Set {
                        path: child_path,
                        value: new_val.clone(),
                    }),
                }
            }
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    ops.push(WriteOp::Delete {
                        path: path.child(Token::field(key.clone())),
                    });
                }
            }
        }
        (Value::Array(old_arr), Value::Array(new_arr)) => {
            for (i, new_val) in new_arr.iter().enumerate() {
                let child_path = path.child(Token::index(i));
                match old_arr.get(i) {
                    Some(old_val) => diff_into(old_val, new_val, &child_path, ops),
                    None => ops.push(WriteOp::Set {
                        path: child_path,
                        value: new_val.clone(),
                    }),
                }
            }
            for i in (new_arr.len()..old_arr.len()).rev() {
                ops.push(WriteOp::Delete {
                    path: path.child(Token::index(i)),
                });
            }
        }
        _ => ops.push(WriteOp::Set {
            path: path.clone(),
            value: new.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_leaf_emits_nothing() {
        let ops = diff_ops(&serde_json::json!({"a": 1}), &serde_json::json!({"a": 1}), &PathBuf::root());
        assert!(ops.is_empty());
    }

    #[test]
    fn changed_leaf_emits_single_set() {
        let ops = diff_ops(&serde_json::json!({"a": 1}), &serde_json::json!({"a": 2}), &PathBuf::root());
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], WriteOp::Set { path, value } if path.to_json_pointer() == "/a" && *value == serde_json::json!(2)));
    }

    #[test]
    fn array_shrink_deletes_from_the_tail() {
        let old = serde_json::json!({"xs": [1, 2, 3]});
        let new = serde_json::json!({"xs": [1]});
        let ops = diff_ops(&old, &new, &PathBuf::root());
        let paths: Vec<String> = ops.iter().map(|op| op.path().to_json_pointer()).collect();
        assert_eq!(paths, vec!["/xs/2".to_string(), "/xs/1".to_string()]);
    }

    #[test]
    fn differing_links_diff_as_one_atomic_set() {
        use common_path::Entity;
        let old = Link::inline(Entity::new("of:a"), PathBuf::root()).to_json();
        let new = Link::inline(Entity::new("of:b"), PathBuf::root()).to_json();
        let ops = diff_ops(&old, &new, &PathBuf::root());
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], WriteOp::Set { path, value } if path.to_json_pointer() == "" && *value == new));
    }

    #[test]
    fn removed_key_emits_delete() {
        let old = serde_json::json!({"a": 1, "b": 2});
        let new = serde_json::json!({"a": 1});
        let ops = diff_ops(&old, &new, &PathBuf::root());
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], WriteOp::Delete { path } if path.to_json_pointer() == "/b"));
    }
}
