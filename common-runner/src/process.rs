//! Process cell lifecycle: seed/reuse/live-update/cancel-restart,
//! node instantiation per module kind, graceful stop (spec.md §4.9).

use crate::error::{Result, RunnerError};
use crate::function::FunctionCache;
use crate::node::{collect_binding_addrs, JsNodeAction, PassthroughAction};
use crate::registry::{ModuleRegistry, RawContext};
use crate::types::{Module, Node, Recipe};
use common_branch::BranchEngine;
use common_cell::{Cell, CellTx};
use common_path::{Entity, Link, PathBuf, Space, Token};
use common_scheduler::{RunId, Scheduler};
use common_tx::TxProcessor;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Stream bindings are conventionally addressed through a path ending
/// in this reserved field name; a node whose input resolves through it
/// is treated as an event handler rather than a one-shot action (a
/// structural stand-in for schema-driven `asStream` detection).
pub const STREAM_MARKER: &str = "$stream";

struct ActiveRun {
    recipe_id: String,
    argument: Value,
    run_id: RunId,
}

/// A handle to a running (possibly nested) recipe invocation.
pub struct RunHandle {
    scheduler: Arc<Mutex<Scheduler>>,
    run_id: RunId,
}

impl RunHandle {
    /// Cancels this run and every nested sub-recipe run spawned under
    /// it (spec.md §5 "idempotent and synchronous relative to new
    /// action registration").
    pub fn cancel(&self) {
        self.scheduler.lock().expect("scheduler lock").cancel(self.run_id);
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }
}

pub struct ProcessRunner {
    branches: Arc<BranchEngine>,
    processor: Arc<TxProcessor>,
    scheduler: Arc<Mutex<Scheduler>>,
    registry: Arc<ModuleRegistry>,
    functions: Arc<FunctionCache>,
    branch: String,
    actor_id: String,
    active: Mutex<HashMap<Entity, ActiveRun>>,
}

impl ProcessRunner {
    pub fn new(
        branches: Arc<BranchEngine>,
        processor: Arc<TxProcessor>,
        scheduler: Arc<Mutex<Scheduler>>,
        registry: Arc<ModuleRegistry>,
        functions: Arc<FunctionCache>,
        branch: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            branches,
            processor,
            scheduler,
            registry,
            functions,
            branch: branch.into(),
            actor_id: actor_id.into(),
            active: Mutex::new(HashMap::new()),
        }
    }

    fn cell(&self, space: &Space, entity: &Entity) -> Cell {
        Cell::new(self.branches.clone(), space.clone(), self.branch.clone(), entity.clone())
    }

    fn open_tx(&self, space: &Space) -> Arc<CellTx> {
        Arc::new(CellTx::open(
            self.processor.clone(),
            self.branches.clone(),
            space.clone(),
            self.branch.clone(),
            self.actor_id.clone(),
        ))
    }

    /// Runs `recipe` against `argument`, materializing into a process
    /// cell owned by `result_cell` (spec.md §4.9 steps 1-4).
    pub fn run(&self, recipe: &Recipe, argument: Value, result_cell: &Cell) -> Result<RunHandle> {
        self.run_inner(recipe, argument, result_cell, None)
    }

    fn run_inner(
        &self,
        recipe: &Recipe,
        argument: Value,
        result_cell: &Cell,
        parent_run: Option<RunId>,
    ) -> Result<RunHandle> {
        let space = result_cell.space().clone();
        let process_entity = Entity::derive(
            format!("{}:{}:processCell", result_cell.root(), result_cell.path().to_json_pointer()).as_bytes(),
        );

        // Step 1: reuse or create + link the process cell.
        let seed_tx = self.open_tx(&space);
        let linked_result_cell = result_cell.clone().with_tx(seed_tx.clone());
        linked_result_cell
            .key(Token::field("sourceCell"))
            .set(Link::inline(process_entity.clone(), PathBuf::root()).to_json())?;

        // Step 2: decide no-op / live-update / cancel-restart.
        {
            let mut active = self.active.lock().expect("active runs lock");
            if let Some(existing) = active.get_mut(&process_entity) {
                if existing.recipe_id == recipe.id && existing.argument == argument {
                    return Ok(RunHandle { scheduler: self.scheduler.clone(), run_id: existing.run_id });
                }
                if existing.recipe_id == recipe.id {
                    let p_cell = self.cell(&space, &process_entity).with_tx(seed_tx.clone());
                    p_cell.key(Token::field("argument")).set(argument.clone())?;
                    seed_tx.commit()?;
                    existing.argument = argument;
                    return Ok(RunHandle { scheduler: self.scheduler.clone(), run_id: existing.run_id });
                }
                self.scheduler.lock().expect("scheduler lock").cancel(existing.run_id);
                active.remove(&process_entity);
            }
        }

        let run_id = self.scheduler.lock().expect("scheduler lock").begin_run(parent_run);

        // Step 3: seed TYPE/spell/internal/argument.
        let p_cell = self.cell(&space, &process_entity).with_tx(seed_tx.clone());
        p_cell.key(Token::field("TYPE")).set(Value::String(recipe.id.clone()))?;
        p_cell
            .key(Token::field("spell"))
            .set(Value::String(blake3::hash(serde_json::to_vec(recipe)?.as_slice()).to_hex().to_string()))?;

        let existing_internal = p_cell.key(Token::field("internal")).get();
        let mut internal = defaults_for_schema(&recipe.argument_schema);
        if let Some(initial) = &recipe.initial {
            if let Some(v) = &initial.internal {
                internal = merge_overlay(internal, v.clone());
            }
        }
        if !existing_internal.is_null() {
            internal = merge_overlay(internal, existing_internal);
        }
        p_cell.key(Token::field("internal")).set(internal)?;
        p_cell.key(Token::field("argument")).set(argument.clone())?;

        // Step 4: instantiate nodes.
        for (index, node) in recipe.nodes.iter().enumerate() {
            let inputs_path = p_cell.key(Token::field("nodes")).key(Token::index(index)).key(Token::field("inputs"));
            let outputs_path =
                p_cell.key(Token::field("nodes")).key(Token::index(index)).key(Token::field("outputs"));
            inputs_path.set(node.inputs.clone())?;
            outputs_path.set(node.outputs.clone())?;
        }
        seed_tx.commit()?;

        self.active.lock().expect("active runs lock").insert(
            process_entity.clone(),
            ActiveRun { recipe_id: recipe.id.clone(), argument, run_id },
        );

        for (index, node) in recipe.nodes.iter().enumerate() {
            self.instantiate_node(&space, &process_entity, run_id, index, node)?;
        }

        Ok(RunHandle { scheduler: self.scheduler.clone(), run_id })
    }

    fn instantiate_node(
        &self,
        space: &Space,
        process_entity: &Entity,
        run_id: RunId,
        index: usize,
        node: &Node,
    ) -> Result<()> {
        self.instantiate_module(space, process_entity, run_id, index, &node.module, &node.inputs, &node.outputs)
    }

    #[allow(clippy::too_many_arguments)]
    fn instantiate_module(
        &self,
        space: &Space,
        process_entity: &Entity,
        run_id: RunId,
        index: usize,
        module: &Module,
        inputs_tree: &Value,
        outputs_tree: &Value,
    ) -> Result<()> {
        if is_stream_binding(inputs_tree) {
            tracing::debug!(node = index, "registering node as a stream event handler");
        }

        let p_cell = self.cell(space, process_entity);
        let inputs_cell =
            p_cell.key(Token::field("nodes")).key(Token::index(index)).key(Token::field("inputs"));

        match module {
            Module::Passthrough => {
                let action = PassthroughAction::new(
                    self.branches.clone(),
                    self.processor.clone(),
                    space.clone(),
                    self.branch.clone(),
                    self.actor_id.clone(),
                    inputs_cell,
                    inputs_tree.clone(),
                    outputs_tree.clone(),
                );
                self.scheduler.lock().expect("scheduler lock").register(run_id, Box::new(action));
                Ok(())
            }
            Module::Javascript { implementation, .. } => {
                let function = self.functions.get(&implementation.fingerprint())?;
                let action = JsNodeAction::new(
                    self.branches.clone(),
                    self.processor.clone(),
                    space.clone(),
                    self.branch.clone(),
                    self.actor_id.clone(),
                    inputs_cell,
                    inputs_tree.clone(),
                    outputs_tree.clone(),
                    function,
                );
                self.scheduler.lock().expect("scheduler lock").register(run_id, Box::new(action));
                Ok(())
            }
            Module::Raw { implementation } => {
                let factory = self.registry.resolve_factory(implementation)?;
                let ctx = RawContext { inputs: inputs_tree, outputs: outputs_tree, run_id };
                let action = factory.build(ctx);
                self.scheduler.lock().expect("scheduler lock").register(run_id, action);
                Ok(())
            }
            Module::Recipe { implementation } => {
                let child_result = Entity::derive(
                    format!("{}:{}:node{}:childResult", process_entity, implementation.id, index).as_bytes(),
                );
                let child_result_cell = self.cell(space, &child_result);
                let argument = inputs_cell.get();
                self.run_inner(implementation, argument, &child_result_cell, Some(run_id))?;

                let link = Link::write_redirect(child_result, PathBuf::root()).to_json();
                let tx = self.open_tx(space);
                write_outer_binding(&self.branches, space, &self.branch, &tx, outputs_tree, &link)?;
                tx.commit()?;
                Ok(())
            }
            Module::Ref { reference } => {
                let resolved = self.registry.resolve_ref(reference)?;
                self.instantiate_module(space, process_entity, run_id, index, &resolved, inputs_tree, outputs_tree)
            }
        }
    }

    /// Cancels the active run for `process_entity`, leaving its stored
    /// data (TYPE/spell/internal/argument/nodes) intact so a later
    /// `run` with the same recipe and argument observes a no-op reuse
    /// rather than a fresh seed (spec.md §4.9 step 7).
    pub fn stop(&self, process_entity: &Entity) -> Result<()> {
        let mut active = self.active.lock().expect("active runs lock");
        let run = active.remove(process_entity).ok_or_else(|| RunnerError::NoActiveRun(process_entity.clone()))?;
        self.scheduler.lock().expect("scheduler lock").cancel(run.run_id);
        Ok(())
    }
}

fn is_stream_binding(tree: &Value) -> bool {
    let mut addrs = Vec::new();
    collect_binding_addrs(&Space::new("_"), tree, &mut addrs);
    addrs.iter().any(|a| matches!(a.path.as_path().last(), Some(Token::Field(f)) if f == STREAM_MARKER))
}

fn write_outer_binding(
    branches: &Arc<BranchEngine>,
    space: &Space,
    branch: &str,
    tx: &Arc<CellTx>,
    tree: &Value,
    value: &Value,
) -> common_cell::Result<()> {
    if let Some(link) = Link::from_json(tree) {
        let mut cell = Cell::new(branches.clone(), space.clone(), branch, link.id);
        for token in link.path.as_path() {
            cell = cell.key(token.clone());
        }
        return cell.with_tx(tx.clone()).set(value.clone());
    }
    Ok(())
}

/// Materializes a JSON Schema's declared defaults into a concrete
/// value (spec.md §7: "for every cell returned from a schema with
/// `default`, if the underlying value is absent, the materialized
/// value is structurally equal to the schema's default expansion").
fn defaults_for_schema(schema: &Value) -> Value {
    if let Some(default) = schema.get("default") {
        return default.clone();
    }
    if schema.get("type").and_then(Value::as_str) == Some("object") {
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            let mut out = serde_json::Map::new();
            for (key, sub_schema) in props {
                let sub_default = defaults_for_schema(sub_schema);
                if !sub_default.is_null() {
                    out.insert(key.clone(), sub_default);
                }
            }
            return Value::Object(out);
        }
    }
    Value::Null
}

/// Deep-merges `overlay` onto `base`: object keys recurse, anything
/// else in `overlay` (including explicit `null`) replaces `base`
/// outright.
fn merge_overlay(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                let merged = match base_map.remove(&k) {
                    Some(existing) => merge_overlay(existing, v),
                    None => v,
                };
                base_map.insert(k, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InitialState;

    fn make_runner() -> (ProcessRunner, Arc<BranchEngine>, Space) {
        let branches = Arc::new(BranchEngine::memory().unwrap());
        let processor = Arc::new(TxProcessor::memory(branches.clone()).unwrap());
        let scheduler = Arc::new(Mutex::new(Scheduler::new()));
        let registry = Arc::new(ModuleRegistry::new());
        let functions = Arc::new(FunctionCache::new());
        let space = Space::new("did:key:zSpace");
        (
            ProcessRunner::new(branches.clone(), processor, scheduler, registry, functions, "main", "runner"),
            branches,
            space,
        )
    }

    fn passthrough_recipe() -> Recipe {
        Recipe {
            id: "identity".into(),
            argument_schema: serde_json::json!({"type": "object"}),
            result_schema: None,
            initial: Some(InitialState { internal: None }),
            nodes: vec![],
        }
    }

    #[test]
    fn rerunning_same_recipe_and_argument_is_a_noop() {
        let (runner, branches, space) = make_runner();
        let result_entity = Entity::new("of:result1");
        let result_cell = Cell::new(branches, space, "main", result_entity);
        let recipe = passthrough_recipe();
        let h1 = runner.run(&recipe, serde_json::json!({"x": 1}), &result_cell).unwrap();
        let h2 = runner.run(&recipe, serde_json::json!({"x": 1}), &result_cell).unwrap();
        assert_eq!(h1.run_id(), h2.run_id());
    }

    #[test]
    fn different_argument_keeps_same_run_id_live_update() {
        let (runner, branches, space) = make_runner();
        let result_entity = Entity::new("of:result2");
        let result_cell = Cell::new(branches, space, "main", result_entity);
        let recipe = passthrough_recipe();
        let h1 = runner.run(&recipe, serde_json::json!({"x": 1}), &result_cell).unwrap();
        let h2 = runner.run(&recipe, serde_json::json!({"x": 2}), &result_cell).unwrap();
        assert_eq!(h1.run_id(), h2.run_id());
    }

    #[test]
    fn different_recipe_id_starts_a_new_run() {
        let (runner, branches, space) = make_runner();
        let result_entity = Entity::new("of:result3");
        let result_cell = Cell::new(branches, space, "main", result_entity);
        let mut recipe_a = passthrough_recipe();
        recipe_a.id = "a".into();
        let mut recipe_b = passthrough_recipe();
        recipe_b.id = "b".into();
        let h1 = runner.run(&recipe_a, serde_json::json!({}), &result_cell).unwrap();
        let h2 = runner.run(&recipe_b, serde_json::json!({}), &result_cell).unwrap();
        assert_ne!(h1.run_id(), h2.run_id());
    }

    #[test]
    fn merge_overlay_prefers_overlay_leaves_but_recurses_objects() {
        let base = serde_json::json!({"a": 1, "nested": {"x": 1, "y": 2}});
        let overlay = serde_json::json!({"nested": {"y": 99}});
        let merged = merge_overlay(base, overlay);
        assert_eq!(merged, serde_json::json!({"a": 1, "nested": {"x": 1, "y": 99}}));
    }

    #[test]
    fn defaults_for_schema_walks_object_properties() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "count": {"default": 0},
                "label": {"type": "string"}
            }
        });
        let defaults = defaults_for_schema(&schema);
        assert_eq!(defaults, serde_json::json!({"count": 0}));
    }
}
