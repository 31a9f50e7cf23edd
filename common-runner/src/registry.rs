//! Resolution of `ref` modules and `raw` module factories by name
//! (spec.md §4.9 step 4).

use crate::error::{Result, RunnerError};
use crate::types::Module;
use common_scheduler::{Action, RunId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Context handed to a [`RawFactory`] when instantiating a `raw` node
/// (spec.md: "call the module's factory with (inputsCell, send,
/// addCancel, context, P, runtime)"). `inputs`/`outputs` are the raw
/// binding trees; the factory is responsible for resolving any cells
/// it needs from them itself.
pub struct RawContext<'a> {
    pub inputs: &'a Value,
    pub outputs: &'a Value,
    pub run_id: RunId,
}

/// Builds the boxed [`Action`] a `raw` module registers with the
/// scheduler.
pub trait RawFactory: Send + Sync {
    fn build(&self, ctx: RawContext<'_>) -> Box<dyn Action>;
}

#[derive(Default)]
pub struct ModuleRegistry {
    refs: Mutex<HashMap<String, Module>>,
    factories: Mutex<HashMap<String, std::sync::Arc<dyn RawFactory>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_ref(&self, name: impl Into<String>, module: Module) {
        self.refs.lock().expect("module registry lock").insert(name.into(), module);
    }

    pub fn resolve_ref(&self, name: &str) -> Result<Module> {
        self.refs
            .lock()
            .expect("module registry lock")
            .get(name)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownModuleRef(name.to_string()))
    }

    pub fn register_factory(&self, name: impl Into<String>, factory: std::sync::Arc<dyn RawFactory>) {
        self.factories.lock().expect("factory registry lock").insert(name.into(), factory);
    }

    pub fn resolve_factory(&self, name: &str) -> Result<std::sync::Arc<dyn RawFactory>> {
        self.factories
            .lock()
            .expect("factory registry lock")
            .get(name)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownFactory(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_ref_errors() {
        let reg = ModuleRegistry::new();
        assert!(reg.resolve_ref("missing").is_err());
    }

    #[test]
    fn registered_ref_resolves() {
        let reg = ModuleRegistry::new();
        reg.register_ref("shared:identity", Module::Passthrough);
        assert!(matches!(reg.resolve_ref("shared:identity").unwrap(), Module::Passthrough));
    }
}
