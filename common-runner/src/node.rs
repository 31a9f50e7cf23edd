//! Scheduler actions for `passthrough` and `javascript` nodes (spec.md
//! §4.9 step 4). `raw` nodes build their own [`common_scheduler::Action`]
//! via a [`crate::RawFactory`]; `recipe` nodes spawn a nested run
//! instead of registering a single action.

use crate::function::JsFunction;
use common_branch::BranchEngine;
use common_cell::{Cell, CellTx};
use common_path::{Entity, Link, PathBuf, Space};
use common_scheduler::{Action, Addr, PollResult, ReadSpec};
use common_tx::TxProcessor;
use serde_json::Value;
use std::sync::Arc;

/// Walks a binding tree (JSON with embedded links) and collects every
/// link target as a dependency address.
pub fn collect_binding_addrs(space: &Space, tree: &Value, out: &mut Vec<Addr>) {
    if let Some(link) = Link::from_json(tree) {
        out.push(Addr::new(space.clone(), link.id, link.path));
        return;
    }
    match tree {
        Value::Object(map) => map.values().for_each(|v| collect_binding_addrs(space, v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_binding_addrs(space, v, out)),
        _ => {}
    }
}

fn cell_at(branches: &Arc<BranchEngine>, space: &Space, branch: &str, entity: &Entity, path: &PathBuf) -> Cell {
    let mut cell = Cell::new(branches.clone(), space.clone(), branch, entity.clone());
    for token in path.as_path() {
        cell = cell.key(token.clone());
    }
    cell
}

/// Writes `result` through an outputs binding tree: wherever the tree
/// holds a link, the corresponding sub-value of `result` (same
/// position) is written to that link's target.
fn write_bindings(
    branches: &Arc<BranchEngine>,
    space: &Space,
    branch: &str,
    tx: &Arc<CellTx>,
    tree: &Value,
    result: &Value,
) -> common_cell::Result<()> {
    if let Some(link) = Link::from_json(tree) {
        let target = cell_at(branches, space, branch, &link.id, &link.path).with_tx(tx.clone());
        return target.set(result.clone());
    }
    match tree {
        Value::Object(map) => {
            for (k, subtree) in map {
                let sub_result = result.get(k).cloned().unwrap_or(Value::Null);
                write_bindings(branches, space, branch, tx, subtree, &sub_result)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, subtree) in items.iter().enumerate() {
                let sub_result = result.get(i).cloned().unwrap_or(Value::Null);
                write_bindings(branches, space, branch, tx, subtree, &sub_result)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

struct RunContext {
    branches: Arc<BranchEngine>,
    processor: Arc<TxProcessor>,
    space: Space,
    branch: String,
    actor_id: String,
}

impl RunContext {
    fn open_tx(&self) -> Arc<CellTx> {
        Arc::new(CellTx::open(
            self.processor.clone(),
            self.branches.clone(),
            self.space.clone(),
            self.branch.clone(),
            self.actor_id.clone(),
        ))
    }
}

/// A `passthrough` node: copies its resolved inputs straight to
/// whatever the outputs tree binds.
pub struct PassthroughAction {
    ctx: RunContext,
    inputs_cell: Cell,
    outputs_tree: Value,
    reads: Vec<ReadSpec>,
    writes: Vec<Addr>,
}

impl PassthroughAction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        branches: Arc<BranchEngine>,
        processor: Arc<TxProcessor>,
        space: Space,
        branch: String,
        actor_id: String,
        inputs_cell: Cell,
        inputs_tree: Value,
        outputs_tree: Value,
    ) -> Self {
        let mut read_addrs = Vec::new();
        collect_binding_addrs(&space, &inputs_tree, &mut read_addrs);
        let mut writes = Vec::new();
        collect_binding_addrs(&space, &outputs_tree, &mut writes);
        Self {
            ctx: RunContext { branches, processor, space, branch, actor_id },
            inputs_cell,
            outputs_tree,
            reads: read_addrs.into_iter().map(ReadSpec::tracked).collect(),
            writes,
        }
    }
}

impl Action for PassthroughAction {
    fn reads(&self) -> &[ReadSpec] {
        &self.reads
    }

    fn writes(&self) -> &[Addr] {
        &self.writes
    }

    fn poll(&mut self) -> PollResult {
        let value = self.inputs_cell.get();
        let tx = self.ctx.open_tx();
        if write_bindings(&self.ctx.branches, &self.ctx.space, &self.ctx.branch, &tx, &self.outputs_tree, &value)
            .is_err()
        {
            return PollResult::Yielded;
        }
        if tx.commit().is_err() {
            return PollResult::Yielded;
        }
        PollResult::Ready
    }
}

/// A `javascript` node: calls a cached compiled function over its
/// resolved inputs and writes the result through the outputs tree.
pub struct JsNodeAction {
    ctx: RunContext,
    inputs_cell: Cell,
    outputs_tree: Value,
    function: Arc<dyn JsFunction>,
    reads: Vec<ReadSpec>,
    writes: Vec<Addr>,
}

impl JsNodeAction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        branches: Arc<BranchEngine>,
        processor: Arc<TxProcessor>,
        space: Space,
        branch: String,
        actor_id: String,
        inputs_cell: Cell,
        inputs_tree: Value,
        outputs_tree: Value,
        function: Arc<dyn JsFunction>,
    ) -> Self {
        let mut read_addrs = Vec::new();
        collect_binding_addrs(&space, &inputs_tree, &mut read_addrs);
        let mut writes = Vec::new();
        collect_binding_addrs(&space, &outputs_tree, &mut writes);
        Self {
            ctx: RunContext { branches, processor, space, branch, actor_id },
            inputs_cell,
            outputs_tree,
            function,
            reads: read_addrs.into_iter().map(ReadSpec::tracked).collect(),
            writes,
        }
    }
}

impl Action for JsNodeAction {
    fn reads(&self) -> &[ReadSpec] {
        &self.reads
    }

    fn writes(&self) -> &[Addr] {
        &self.writes
    }

    fn poll(&mut self) -> PollResult {
        let input = self.inputs_cell.get();
        let result = match self.function.call(&input) {
            Ok(v) => v,
            Err(_) => return PollResult::Yielded,
        };
        let tx = self.ctx.open_tx();
        if write_bindings(&self.ctx.branches, &self.ctx.space, &self.ctx.branch, &tx, &self.outputs_tree, &result)
            .is_err()
        {
            return PollResult::Yielded;
        }
        if tx.commit().is_err() {
            return PollResult::Yielded;
        }
        PollResult::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_tx::TxProcessor as Processor;

    fn setup() -> (Arc<BranchEngine>, Arc<Processor>, Space) {
        let branches = Arc::new(BranchEngine::memory().unwrap());
        let processor = Arc::new(Processor::memory(branches.clone()).unwrap());
        (branches, processor, Space::new("did:key:zSpace"))
    }

    #[test]
    fn passthrough_copies_resolved_input_to_output_target() {
        let (branches, processor, space) = setup();
        let source = Entity::new("of:source");
        let dest = Entity::new("of:dest");

        let seed_tx = Arc::new(CellTx::open(processor.clone(), branches.clone(), space.clone(), "main", "seed"));
        let source_cell = Cell::new(branches.clone(), space.clone(), "main", source.clone()).with_tx(seed_tx.clone());
        source_cell.set(serde_json::json!({"value": 42})).unwrap();
        seed_tx.commit().unwrap();

        let inputs_tree = Link::inline(source.clone(), PathBuf::root()).to_json();
        let outputs_tree = Link::write_redirect(dest.clone(), PathBuf::root()).to_json();
        let inputs_cell = cell_at(&branches, &space, "main", &source, &PathBuf::root());

        let mut action = PassthroughAction::new(
            branches.clone(),
            processor.clone(),
            space.clone(),
            "main".into(),
            "node-actor".into(),
            inputs_cell,
            inputs_tree,
            outputs_tree,
        );
        assert!(matches!(action.poll(), PollResult::Ready));

        let dest_cell = Cell::new(branches, space, "main", dest);
        assert_eq!(dest_cell.get(), serde_json::json!({"value": 42}));
    }
}
