//! The cell: a schema-projected, transaction-aware view over one
//! location in a branch's materialized document (spec.md §4.7).

use crate::diff::diff_ops;
use crate::error::{CellError, Result};
use crate::identity::{ArrayIdentityScope, ID_FIELD};
use crate::resolver::BranchResolver;
use crate::tx::CellTx;
use common_branch::{BranchEngine, WriteOp};
use common_path::{Entity, Link, Path, PathBuf, Space, Token};
use common_schema::{evaluate, DocResolver, EvalOutcome, IrId, SchemaIr};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// A cancel handle returned by [`Cell::sink`]. Dropping it is equivalent
/// to calling [`Cancel::cancel`].
pub struct Cancel {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl Cancel {
    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }
}

type SinkCallback = Box<dyn FnMut(&Value) + Send>;

struct Subscription {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    callback: Mutex<SinkCallback>,
    last_touches: Mutex<std::collections::BTreeSet<(Entity, PathBuf)>>,
}

/// A schema-projected, transaction-bindable view over `(space, root,
/// path)`.
#[derive(Clone)]
pub struct Cell {
    branches: Arc<BranchEngine>,
    space: Space,
    branch: String,
    root: Entity,
    path: PathBuf,
    schema_ir: Option<(Arc<Mutex<SchemaIr>>, IrId)>,
    tx: Option<Arc<CellTx>>,
    subscriptions: Arc<Mutex<Vec<Arc<Subscription>>>>,
}

impl Cell {
    pub fn new(branches: Arc<BranchEngine>, space: Space, branch: impl Into<String>, root: Entity) -> Self {
        Self {
            branches,
            space,
            branch: branch.into(),
            root,
            path: PathBuf::root(),
            schema_ir: None,
            tx: None,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn root(&self) -> &Entity {
        &self.root
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn resolver(&self) -> BranchResolver {
        BranchResolver::new(self.branches.clone(), self.space.clone(), self.branch.clone())
    }

    fn root_value(&self) -> Value {
        self.branches
            .cached_json(&self.space, &self.root, &self.branch)
            .ok()
            .flatten()
            .unwrap_or(Value::Null)
    }

    /// Materializes this cell's projection, following links encountered
    /// while descending so the returned value never exposes a raw link
    /// sigil at `path` itself (spec.md §4.7: "immutable annotated values
    /// carrying back-pointers for identity reconstruction" — the
    /// back-pointer here is the resolved `(entity, path)` this function
    /// returns alongside the value via [`Cell::resolved_identity`]).
    pub fn get(&self) -> Value {
        if let Some((ir, ir_id)) = &self.schema_ir {
            if ir.lock().expect("schema ir lock").is_as_cell(*ir_id) {
                return self.get_as_link();
            }
        }
        let raw = descend(&self.root_value(), self.path.as_path());
        let mut budget = 4096u32;
        let resolved = self.resolve_deep(&raw, &mut budget);
        if resolved.is_null() {
            if let Some((ir, ir_id)) = &self.schema_ir {
                if let Some(default) = ir.lock().expect("schema ir lock").default_for(*ir_id) {
                    return default.clone();
                }
            }
        }
        resolved
    }

    /// True if this cell's bound schema marks it `asStream` (spec.md §4.9):
    /// the location is a stream address rather than a plain value, and
    /// writes to it should be treated as pushes rather than replacements.
    pub fn is_stream_schema(&self) -> bool {
        match &self.schema_ir {
            Some((ir, ir_id)) => ir.lock().expect("schema ir lock").is_as_stream(*ir_id),
            None => false,
        }
    }

    /// Recursively replaces every link-shaped value anywhere in `value`
    /// with its resolved target, bounded by `budget` link-follows total
    /// (spec.md §4.7: `get()` "returns immutable annotated values...
    /// carrying back-pointers for identity reconstruction" — every link
    /// in the projected tree is followed, not just one at the cell's own
    /// root).
    fn resolve_deep(&self, value: &Value, budget: &mut u32) -> Value {
        if *budget == 0 {
            return value.clone();
        }
        if let Some(link) = Link::from_json(value) {
            *budget -= 1;
            let target_root = self.resolver().get(&link.id).unwrap_or(Value::Null);
            let target_value = descend(&target_root, link.path.as_path());
            return self.resolve_deep(&target_value, budget);
        }
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_deep(v, budget)))
                    .collect(),
            ),
            Value::Array(arr) => Value::Array(arr.iter().map(|v| self.resolve_deep(v, budget)).collect()),
            other => other.clone(),
        }
    }

    /// The `(entity, path)` this cell's value is ultimately read from,
    /// after following every link on the way (used by `equals` and by
    /// `getAsLink`).
    fn resolve(&self) -> (Entity, PathBuf, Value) {
        let resolver = self.resolver();
        let mut entity = self.root.clone();
        let mut path = self.path.clone();
        let mut value = descend(&self.root_value(), path.as_path());
        let mut hops = 0;
        while let Some(link) = value.as_ref().and_then(Link::from_json) {
            hops += 1;
            if hops > 64 {
                break;
            }
            entity = link.id;
            path = link.path;
            value = resolver.get(&entity).map(|doc| descend(&doc, path.as_path()));
        }
        (entity, path, value.unwrap_or(Value::Null))
    }

    /// Evaluates this cell's bound schema against its current value,
    /// recording touches/link edges/labels (spec.md §4.5, §4.6).
    pub fn eval_outcome(&self) -> Option<EvalOutcome> {
        let (ir, ir_id) = self.schema_ir.as_ref()?;
        let ir = ir.lock().expect("schema ir lock");
        Some(evaluate(&ir, &self.resolver(), *ir_id, &self.root, &self.path))
    }

    /// Binds a compiled schema to this cell, returning a new cell with
    /// the same identity re-read under it (spec.md `asSchema`).
    pub fn as_schema(&self, ir: Arc<Mutex<SchemaIr>>, ir_id: IrId) -> Self {
        let mut cell = self.clone();
        cell.schema_ir = Some((ir, ir_id));
        cell
    }

    /// A child cell at `path ∪ [segment]` (spec.md `key`). Schema
    /// narrowing to the child's sub-schema is left to the caller via
    /// `as_schema`, since that requires walking the compiled IR's
    /// `Props`/`ItemsEach` edges, which only the schema crate knows how
    /// to interpret.
    pub fn key(&self, segment: Token) -> Self {
        let mut cell = self.clone();
        cell.path = self.path.child(segment);
        cell
    }

    /// Binds this cell to an open transaction for writes (spec.md
    /// `withTx`).
    pub fn with_tx(&self, tx: Arc<CellTx>) -> Self {
        let mut cell = self.clone();
        cell.tx = Some(tx);
        cell
    }

    /// Normalized identity equality: both cells resolve (after following
    /// links) to the same `(entity, path)` (spec.md `equals`).
    pub fn equals(&self, other: &Cell) -> bool {
        let (e1, p1, _) = self.resolve();
        let (e2, p2, _) = other.resolve();
        e1 == e2 && p1 == p2
    }

    /// Serializes this cell's identity as a link value (spec.md
    /// `getAsLink`).
    pub fn get_as_link(&self) -> Value {
        Link::inline(self.root.clone(), self.path.clone()).to_json()
    }

    /// Serializes this cell's identity as a write-redirect link (spec.md
    /// `getAsWriteRedirectLink`).
    pub fn get_as_write_redirect_link(&self) -> Value {
        Link::write_redirect(self.root.clone(), self.path.clone()).to_json()
    }

    fn tx(&self) -> Result<&Arc<CellTx>> {
        self.tx.as_ref().ok_or(CellError::NoOpenTx)
    }

    /// Writes `value` at this cell's location through any write-redirect
    /// encountered along the way, as a minimum diff against the current
    /// value (spec.md §4.7 `set`). Array elements carrying [`ID_FIELD`] are
    /// routed through the same identity-reuse scheme [`Cell::push`] uses,
    /// so `set`-ing an array that re-lists a previously pushed id updates
    /// that element's entity in place instead of minting a new one.
    pub fn set(&self, value: Value) -> Result<()> {
        let tx = self.tx()?;
        let (entity, path, current) = self.resolve_writable()?;
        let linked_value = self.link_identified_elements(&path, value)?;
        let ops = diff_ops(&current, &linked_value, &path);
        tx.stage(&entity, ops)?;
        Ok(())
    }

    /// When `value` is an array, replaces every `ID_FIELD`-bearing object
    /// element with a write-redirect link to its identity entity (reusing
    /// the entity a prior `push`/`set` minted at the same array path), and
    /// stages that entity's own content diff. Elements without `ID_FIELD`,
    /// and non-array values, pass through unchanged.
    fn link_identified_elements(&self, array_path: &PathBuf, value: Value) -> Result<Value> {
        let Value::Array(items) = value else {
            return Ok(value);
        };
        let tx = self.tx()?;
        let resolver = self.resolver();
        let pointer = array_path.to_json_pointer();
        let mut scope = ArrayIdentityScope::new();
        let mut linked = Vec::with_capacity(items.len());
        for item in items {
            if item.is_object() && item.get(ID_FIELD).is_some() {
                if let Some(child_entity) = scope.resolve(&pointer, &item) {
                    let old_child = resolver.get(&child_entity).unwrap_or(Value::Null);
                    let child_ops = diff_ops(&old_child, &item, &PathBuf::root());
                    if !child_ops.is_empty() {
                        tx.stage(&child_entity, child_ops)?;
                    }
                    linked.push(Link::write_redirect(child_entity, PathBuf::root()).to_json());
                    continue;
                }
            }
            linked.push(item);
        }
        Ok(Value::Array(linked))
    }

    /// Like [`Cell::resolve`] but only follows *write-redirect* links
    /// (`write_redirect: true`); a plain inline link at the write target
    /// is left as-is, since only a redirect absorbs writes.
    fn resolve_writable(&self) -> Result<(Entity, PathBuf, Value)> {
        let resolver = self.resolver();
        let mut entity = self.root.clone();
        let mut path = self.path.clone();
        let mut value = descend(&self.root_value(), path.as_path());
        let mut hops = 0;
        loop {
            let Some(link) = value.as_ref().and_then(Link::from_json) else {
                break;
            };
            if !link.write_redirect {
                break;
            }
            hops += 1;
            if hops > 64 {
                return Err(CellError::UnwritableRedirect(entity));
            }
            entity = link.id;
            path = link.path;
            value = resolver.get(&entity).map(|doc| descend(&doc, path.as_path()));
        }
        Ok((entity, path, value.unwrap_or(Value::Null)))
    }

    /// Per-key merge into an object value, creating `{}` first if absent
    /// (spec.md §4.7 `update`).
    pub fn update(&self, patch: serde_json::Map<String, Value>) -> Result<()> {
        let (_, _, current) = self.resolve_writable()?;
        let mut merged = current.as_object().cloned().unwrap_or_default();
        for (k, v) in patch {
            merged.insert(k, v);
        }
        self.set(Value::Object(merged))
    }

    /// Appends `item` to the array at this cell's location, creating the
    /// array if absent. If `item` carries [`ID_FIELD`], its entity
    /// identity is reused across a sibling element that previously held
    /// the same id at this same array path (spec.md §4.7 `push`, §9).
    pub fn push(&self, item: Value) -> Result<()> {
        let (entity, path, current) = self.resolve_writable()?;
        let mut arr = current.as_array().cloned().unwrap_or_default();
        let index = arr.len();
        let element_path = path.child(Token::index(index));

        if item.is_object() && item.get(ID_FIELD).is_some() {
            let mut scope = ArrayIdentityScope::new();
            if let Some(child_entity) = scope.resolve(&path.to_json_pointer(), &item) {
                let link = Link::write_redirect(child_entity.clone(), PathBuf::root());
                arr.push(link.to_json());
                self.tx()?.stage(&entity, diff_ops(&current, &Value::Array(arr), &path))?;
                self.tx()?.stage(&child_entity, vec![WriteOp::Set {
                    path: PathBuf::root(),
                    value: item,
                }])?;
                return Ok(());
            }
        }

        arr.push(item);
        self.tx()?.stage(&entity, vec![WriteOp::Set {
            path: element_path,
            value: arr.last().cloned().expect("just pushed"),
        }])?;
        Ok(())
    }

    /// Registers `callback` to be invoked whenever this cell's value
    /// would observably change, returning a handle to cancel the
    /// subscription (spec.md `sink`). Driving re-evaluation on commit is
    /// the scheduler's job (`common-scheduler`); this only records what
    /// the scheduler should re-check.
    pub fn sink(&self, callback: impl FnMut(&Value) + Send + 'static) -> Cancel {
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let last_touches = self
            .eval_outcome()
            .map(|o| o.touches)
            .unwrap_or_default();
        let sub = Arc::new(Subscription {
            cancelled: cancelled.clone(),
            callback: Mutex::new(Box::new(callback)),
            last_touches: Mutex::new(last_touches),
        });
        self.subscriptions.lock().expect("subscriptions lock").push(sub.clone());
        // Fire once immediately with the current value, mirroring the
        // scheduler's "run once on registration" wave semantics.
        (sub.callback.lock().expect("callback lock"))(&self.get());
        Cancel { cancelled }
    }

    /// Re-checks every live subscription against a changed `(doc, path)`
    /// and invokes callbacks whose last touch set intersects it. Called
    /// by the scheduler after a commit.
    pub fn notify_touched(&self, doc: &Entity, path: &Path<'_>) {
        let subs = self.subscriptions.lock().expect("subscriptions lock");
        for sub in subs.iter() {
            if sub.cancelled.load(std::sync::atomic::Ordering::SeqCst) {
                continue;
            }
            let touches = sub.last_touches.lock().expect("touches lock");
            let hit = touches
                .iter()
                .any(|(d, p)| d == doc && (p.as_path().is_ancestor(*path) || path.is_ancestor(p.as_path())));
            drop(touches);
            if hit {
                (sub.callback.lock().expect("callback lock"))(&self.get());
                if let Some(outcome) = self.eval_outcome() {
                    *sub.last_touches.lock().expect("touches lock") = outcome.touches;
                }
            }
        }
    }
}

/// Plain JSON descent, stopping (returning `Value::Null`) at a missing
/// path rather than erroring (spec.md §7: "cell reads never throw for
/// missing data").
fn descend(root: &Value, path: Path<'_>) -> Value {
    let mut current = root.clone();
    for token in path {
        current = match token {
            Token::Field(name) => current.get(name).cloned().unwrap_or(Value::Null),
            Token::Index(i) => current.get(*i).cloned().unwrap_or(Value::Null),
        };
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_tx::TxProcessor;

    fn setup() -> (Arc<BranchEngine>, Arc<TxProcessor>, Space, Entity) {
        let branches = Arc::new(BranchEngine::memory().unwrap());
        let processor = Arc::new(TxProcessor::memory(branches.clone()).unwrap());
        (branches, processor, Space::new("did:key:zSpace"), Entity::new("of:doc1"))
    }

    #[test]
    fn set_then_get_round_trips() {
        let (branches, processor, space, root) = setup();
        let tx = Arc::new(CellTx::open(processor, branches.clone(), space.clone(), "main", "actor-a"));
        let cell = Cell::new(branches, space, "main", root).with_tx(tx.clone());
        cell.set(serde_json::json!({"email": "a@example.com"})).unwrap();
        tx.commit().unwrap();
        assert_eq!(cell.get(), serde_json::json!({"email": "a@example.com"}));
    }

    #[test]
    fn key_reads_nested_field() {
        let (branches, processor, space, root) = setup();
        let tx = Arc::new(CellTx::open(processor, branches.clone(), space.clone(), "main", "actor-a"));
        let cell = Cell::new(branches, space, "main", root).with_tx(tx.clone());
        cell.set(serde_json::json!({"user": {"name": "ada"}})).unwrap();
        tx.commit().unwrap();
        let nested = cell.key(Token::field("user")).key(Token::field("name"));
        assert_eq!(nested.get(), serde_json::json!("ada"));
    }

    #[test]
    fn push_with_id_field_links_a_child_entity() {
        let (branches, processor, space, root) = setup();
        let tx = Arc::new(CellTx::open(processor, branches.clone(), space.clone(), "main", "actor-a"));
        let cell = Cell::new(branches, space, "main", root).with_tx(tx.clone());
        let todos = cell.key(Token::field("todos"));
        todos.push(serde_json::json!({"$id": "b", "title": "b", "done": false})).unwrap();
        tx.commit().unwrap();
        let value = todos.get();
        let arr = value.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["title"], serde_json::json!("b"));
    }

    #[test]
    fn set_reuses_pushed_entity_by_id_and_mints_a_fresh_one_for_new_ids() {
        let (branches, processor, space, root) = setup();
        let tx = Arc::new(CellTx::open(processor, branches.clone(), space.clone(), "main", "actor-a"));
        let cell = Cell::new(branches, space, "main", root).with_tx(tx.clone());
        let todos = cell.key(Token::field("todos"));
        todos.push(serde_json::json!({"$id": "b", "title": "b", "done": false})).unwrap();
        tx.commit().unwrap();

        todos
            .set(serde_json::json!([{"$id": "a"}, {"$id": "b", "v": 2}]))
            .unwrap();
        tx.commit().unwrap();

        let after = todos.get();
        let arr = after.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        // index 1 kept the same underlying entity as the original push,
        // with `v` applied and the stale `title`/`done` fields dropped.
        assert_eq!(arr[1], serde_json::json!({"$id": "b", "v": 2}));
        // index 0 got a freshly minted entity holding only its new content.
        assert_eq!(arr[0], serde_json::json!({"$id": "a"}));
    }

    #[test]
    fn get_applies_schema_default_when_value_absent() {
        let (branches, _processor, space, root) = setup();
        let cell = Cell::new(branches, space, "main", root);
        let mut ir = SchemaIr::new();
        let ir_id = ir.compile(&serde_json::json!({"type": "string", "default": "fallback"})).unwrap();
        let cell = cell.as_schema(Arc::new(Mutex::new(ir)), ir_id);
        assert_eq!(cell.get(), serde_json::json!("fallback"));
    }

    #[test]
    fn is_stream_schema_reflects_schema_annotation() {
        let (branches, _processor, space, root) = setup();
        let cell = Cell::new(branches, space, "main", root);
        let mut ir = SchemaIr::new();
        let ir_id = ir.compile(&serde_json::json!({"type": "object", "asStream": true})).unwrap();
        let cell = cell.as_schema(Arc::new(Mutex::new(ir)), ir_id);
        assert!(cell.is_stream_schema());
    }

    #[test]
    fn write_without_tx_is_rejected() {
        let (branches, _processor, space, root) = setup();
        let cell = Cell::new(branches, space, "main", root);
        let err = cell.set(serde_json::json!(1)).unwrap_err();
        assert!(matches!(err, CellError::NoOpenTx));
    }
}
