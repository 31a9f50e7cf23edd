//! Applies a change's write ops to a materialized JSON document.

use crate::change::WriteOp;
use common_path::Token;
use serde_json::Value;

/// Applies every op in `ops`, in order, to `doc`.
pub fn apply_ops(doc: &mut Value, ops: &[WriteOp]) {
    for op in ops {
        match op {
            WriteOp::Set { path, value } => set_at(doc, path.tokens(), value.clone()),
            WriteOp::Delete { path } => delete_at(doc, path.tokens()),
        }
    }
}

fn set_at(doc: &mut Value, tokens: &[Token], value: Value) {
    if tokens.is_empty() {
        *doc = value;
        return;
    }
    let (head, rest) = (&tokens[0], &tokens[1..]);
    match head {
        Token::Field(name) => {
            if !doc.is_object() {
                *doc = Value::Object(Default::default());
            }
            let map = doc.as_object_mut().expect("just ensured object");
            let slot = map.entry(name.clone()).or_insert(Value::Null);
            set_at(slot, rest, value);
        }
        Token::Index(i) => {
            if !doc.is_array() {
                *doc = Value::Array(Vec::new());
            }
            let arr = doc.as_array_mut().expect("just ensured array");
            while arr.len() <= *i {
                arr.push(Value::Null);
            }
            set_at(&mut arr[*i], rest, value);
        }
    }
}

fn delete_at(doc: &mut Value, tokens: &[Token]) {
    if tokens.is_empty() {
        return;
    }
    let (head, rest) = (&tokens[0], &tokens[1..]);
    if rest.is_empty() {
        match head {
            Token::Field(name) => {
                if let Some(map) = doc.as_object_mut() {
                    map.remove(name);
                }
            }
            Token::Index(i) => {
                if let Some(arr) = doc.as_array_mut() {
                    if *i < arr.len() {
                        arr.remove(*i);
                    }
                }
            }
        }
        return;
    }
    let next = match head {
        Token::Field(name) => doc.as_object_mut().and_then(|m| m.get_mut(name)),
        Token::Index(i) => doc.as_array_mut().and_then(|a| a.get_mut(*i)),
    };
    if let Some(next) = next {
        delete_at(next, rest);
    }
}
