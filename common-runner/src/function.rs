//! Harness-compiled function cache, keyed by implementation fingerprint
//! (spec.md §4.9 step 6). The runner never executes source text
//! itself; something upstream (the harness) compiles an
//! [`ImplementationRef`] to a [`JsFunction`] and registers it here
//! before a recipe referencing it is run.

use crate::error::{Result, RunnerError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A compiled node function: takes the node's materialized input tree,
/// returns its output tree.
pub trait JsFunction: Send + Sync {
    fn call(&self, input: &Value) -> Result<Value>;
}

impl<F> JsFunction for F
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    fn call(&self, input: &Value) -> Result<Value> {
        self(input)
    }
}

#[derive(Default)]
pub struct FunctionCache {
    entries: Mutex<HashMap<String, Arc<dyn JsFunction>>>,
}

impl FunctionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the function for `fingerprint`. Called
    /// on recipe/module update events to invalidate a stale entry by
    /// overwriting it.
    pub fn register(&self, fingerprint: impl Into<String>, function: Arc<dyn JsFunction>) {
        self.entries.lock().expect("function cache lock").insert(fingerprint.into(), function);
    }

    pub fn invalidate(&self, fingerprint: &str) {
        self.entries.lock().expect("function cache lock").remove(fingerprint);
    }

    pub fn get(&self, fingerprint: &str) -> Result<Arc<dyn JsFunction>> {
        self.entries
            .lock()
            .expect("function cache lock")
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownFunction(fingerprint.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_function_is_retrievable_by_fingerprint() {
        let cache = FunctionCache::new();
        cache.register("abc", Arc::new(|v: &Value| Ok(v.clone())));
        let f = cache.get("abc").unwrap();
        assert_eq!(f.call(&serde_json::json!(1)).unwrap(), serde_json::json!(1));
    }

    #[test]
    fn unregistered_fingerprint_errors() {
        let cache = FunctionCache::new();
        assert!(cache.get("missing").is_err());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = FunctionCache::new();
        cache.register("abc", Arc::new(|v: &Value| Ok(v.clone())));
        cache.invalidate("abc");
        assert!(cache.get("abc").is_err());
    }
}
