//! Evaluates a compiled [`SchemaIr`] against a document tree, with
//! link-following, provenance tracking, and cycle safety (spec.md §4.5).

use crate::compiler::SchemaIr;
use crate::ir::{Additional, IrId, IrNode};
use common_path::{Entity, Link, PathBuf, Token};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Default bound on link-follow/recursion steps per evaluation
/// (spec.md §4.5).
pub const DEFAULT_VISIT_LIMIT: u32 = 16_384;

/// The result of checking one IR node at one document location.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Yes,
    No,
    MaybeExceededDepth,
}

impl Verdict {
    fn is_yes(self) -> bool {
        matches!(self, Verdict::Yes)
    }

    /// Combines child verdicts the way `Props`/`ItemsEach` aggregate:
    /// any `No` dominates, else any `Maybe` dominates, else `Yes`.
    fn worst_of(iter: impl IntoIterator<Item = Verdict>) -> Verdict {
        let mut maybe = false;
        for v in iter {
            match v {
                Verdict::No => return Verdict::No,
                Verdict::MaybeExceededDepth => maybe = true,
                Verdict::Yes => {}
            }
        }
        if maybe {
            Verdict::MaybeExceededDepth
        } else {
            Verdict::Yes
        }
    }
}

/// A point in the evaluation space: which IR node, at which document
/// location.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct EvalKey {
    pub ir_id: IrId,
    pub doc: Entity,
    pub path: PathBuf,
}

/// A directed link-follow edge discovered during evaluation.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct LinkEdge {
    pub from_doc: Entity,
    pub from_path: PathBuf,
    pub to_doc: Entity,
    pub to_path: PathBuf,
}

/// The full result of an evaluation (spec.md §4.5).
#[derive(Clone, Debug, Default)]
pub struct EvalOutcome {
    pub verdict: Option<Verdict>,
    pub touches: BTreeSet<(Entity, PathBuf)>,
    pub link_edges: BTreeSet<LinkEdge>,
    pub deps: BTreeSet<EvalKey>,
    pub labels: BTreeSet<String>,
}

/// Supplies document values to the evaluator. `common-cell`/`common-store`
/// provide the real implementation; tests use an in-memory map. `Send + Sync`
/// so a resolver can be shared behind an `Arc<dyn DocResolver>` across
/// threads (spec.md §4.6 subscription engine).
pub trait DocResolver: Send + Sync {
    fn get(&self, doc: &Entity) -> Option<Value>;
}

struct Ctx<'a> {
    ir: &'a SchemaIr,
    resolver: &'a dyn DocResolver,
    visited: HashSet<EvalKey>,
    memo: HashMap<EvalKey, Verdict>,
    budget: u32,
    outcome: EvalOutcome,
}

/// Evaluates IR node `root_id` against `(doc, path)`.
pub fn evaluate(ir: &SchemaIr, resolver: &dyn DocResolver, root_id: IrId, doc: &Entity, path: &PathBuf) -> EvalOutcome {
    evaluate_with_limit(ir, resolver, root_id, doc, path, DEFAULT_VISIT_LIMIT)
}

/// Like [`evaluate`] with an explicit visit-limit override (tests use a
/// small limit to exercise `MaybeExceededDepth` without huge fixtures).
pub fn evaluate_with_limit(
    ir: &SchemaIr,
    resolver: &dyn DocResolver,
    root_id: IrId,
    doc: &Entity,
    path: &PathBuf,
    visit_limit: u32,
) -> EvalOutcome {
    let mut ctx = Ctx {
        ir,
        resolver,
        visited: HashSet::new(),
        memo: HashMap::new(),
        budget: visit_limit,
        outcome: EvalOutcome::default(),
    };
    let verdict = eval_node(&mut ctx, root_id, doc, path);
    ctx.outcome.verdict = Some(verdict);
    ctx.outcome
}

fn descend(value: &Value, tokens: &[Token]) -> Option<Value> {
    let mut cur = value.clone();
    for tok in tokens {
        cur = match tok {
            Token::Field(name) => cur.as_object()?.get(name)?.clone(),
            Token::Index(i) => cur.as_array()?.get(*i)?.clone(),
        };
    }
    Some(cur)
}

/// Locates the effective value at `(doc, path)`, following link-shaped
/// values at the destination (spec.md §4.5 "when reaching an effective
/// value that is itself a link"), bounded by `ctx.budget`.
fn locate(ctx: &mut Ctx, doc: &Entity, path: &PathBuf) -> Option<(Entity, PathBuf, Value)> {
    let mut cur_doc = doc.clone();
    let mut cur_path = path.clone();
    let root = ctx.resolver.get(&cur_doc)?;
    let mut value = descend(&root, cur_path.tokens())?;

    loop {
        ctx.outcome.touches.insert((cur_doc.clone(), cur_path.clone()));
        let Some(link) = Link::from_json(&value) else {
            return Some((cur_doc, cur_path, value));
        };
        if ctx.budget == 0 {
            return Some((cur_doc, cur_path, value));
        }
        ctx.budget -= 1;
        let target_doc: Entity = link.id.clone();
        let target_path = link.path.clone();
        ctx.outcome.link_edges.insert(LinkEdge {
            from_doc: cur_doc.clone(),
            from_path: cur_path.clone(),
            to_doc: target_doc.clone(),
            to_path: target_path.clone(),
        });
        let target_root = ctx.resolver.get(&target_doc)?;
        value = descend(&target_root, target_path.tokens())?;
        cur_doc = target_doc;
        cur_path = target_path;
    }
}

fn eval_node(ctx: &mut Ctx, ir_id: IrId, doc: &Entity, path: &PathBuf) -> Verdict {
    let key = EvalKey {
        ir_id,
        doc: doc.clone(),
        path: path.clone(),
    };
    if let Some(v) = ctx.memo.get(&key) {
        return *v;
    }
    if ctx.visited.contains(&key) {
        // Cycle: preserve the currently-collected verdict rather than
        // recursing again (spec.md §4.5).
        return Verdict::Yes;
    }
    ctx.visited.insert(key.clone());
    ctx.outcome.deps.insert(key.clone());

    if ctx.budget == 0 {
        ctx.memo.insert(key, Verdict::MaybeExceededDepth);
        return Verdict::MaybeExceededDepth;
    }
    ctx.budget -= 1;

    let Some((doc, path, value)) = locate(ctx, doc, path) else {
        ctx.memo.insert(key, Verdict::No);
        return Verdict::No;
    };

    let node = ctx.ir.node(ir_id).clone();
    let verdict = match node {
        IrNode::Any => Verdict::Yes,
        IrNode::Never => Verdict::No,
        IrNode::TypeCheck(t) => {
            if t.matches(&value) {
                Verdict::Yes
            } else {
                Verdict::No
            }
        }
        IrNode::Const(expected) => {
            if value == expected {
                Verdict::Yes
            } else {
                Verdict::No
            }
        }
        IrNode::Enum(options) => {
            if options.contains(&value) {
                Verdict::Yes
            } else {
                Verdict::No
            }
        }
        IrNode::Range {
            minimum,
            maximum,
            exclusive_minimum,
            exclusive_maximum,
        } => {
            let Some(n) = value.as_f64() else {
                ctx.memo.insert(key, Verdict::No);
                return Verdict::No;
            };
            let ok_min = minimum.map_or(true, |m| if exclusive_minimum { n > m } else { n >= m });
            let ok_max = maximum.map_or(true, |m| if exclusive_maximum { n < m } else { n <= m });
            if ok_min && ok_max {
                Verdict::Yes
            } else {
                Verdict::No
            }
        }
        IrNode::Pattern(idx) => match value.as_str() {
            Some(s) if ctx.ir.pattern(idx).is_match(s) => Verdict::Yes,
            _ => Verdict::No,
        },
        IrNode::Props {
            required,
            properties,
            additional,
            labels,
        } => {
            ctx.outcome.labels.extend(labels);
            let Some(obj) = value.as_object() else {
                ctx.memo.insert(key, Verdict::No);
                return Verdict::No;
            };
            if required.iter().any(|r| !obj.contains_key(r)) {
                ctx.memo.insert(key, Verdict::No);
                return Verdict::No;
            }
            let mut child_verdicts = Vec::new();
            let listed: BTreeSet<&str> = properties.iter().map(|(k, _)| k.as_str()).collect();
            for (prop, child_id) in &properties {
                if obj.contains_key(prop) {
                    let child_path = path.child(Token::field(prop.clone()));
                    child_verdicts.push(eval_node(ctx, *child_id, &doc, &child_path));
                }
            }
            match additional {
                Additional::Deny => {
                    if obj.keys().any(|k| !listed.contains(k.as_str())) {
                        child_verdicts.push(Verdict::No);
                    }
                }
                Additional::Schema(schema_id) => {
                    for key_name in obj.keys() {
                        if !listed.contains(key_name.as_str()) {
                            let child_path = path.child(Token::field(key_name.clone()));
                            child_verdicts.push(eval_node(ctx, schema_id, &doc, &child_path));
                        }
                    }
                }
                Additional::Omit | Additional::Allow => {}
            }
            Verdict::worst_of(child_verdicts)
        }
        IrNode::ItemsTuple { items } => {
            let Some(arr) = value.as_array() else {
                ctx.memo.insert(key, Verdict::No);
                return Verdict::No;
            };
            let verdicts = items.iter().enumerate().filter(|(i, _)| *i < arr.len()).map(|(i, item_id)| {
                let child_path = path.child(Token::index(i));
                eval_node(ctx, *item_id, &doc, &child_path)
            });
            Verdict::worst_of(verdicts)
        }
        IrNode::ItemsEach { item } => {
            let Some(arr) = value.as_array() else {
                ctx.memo.insert(key, Verdict::No);
                return Verdict::No;
            };
            let verdicts = (0..arr.len()).map(|i| {
                let child_path = path.child(Token::index(i));
                eval_node(ctx, item, &doc, &child_path)
            });
            Verdict::worst_of(verdicts)
        }
        IrNode::AllOf(ids) => {
            let mut result = Verdict::Yes;
            for id in ids {
                let v = eval_node(ctx, id, &doc, &path);
                if !v.is_yes() {
                    result = v;
                    break;
                }
            }
            result
        }
        IrNode::AnyOf(ids) => {
            let mut any_maybe = false;
            let mut result = Verdict::No;
            for id in ids {
                let v = eval_node(ctx, id, &doc, &path);
                match v {
                    Verdict::Yes => {
                        result = Verdict::Yes;
                        break;
                    }
                    Verdict::MaybeExceededDepth => any_maybe = true,
                    Verdict::No => {}
                }
            }
            if result != Verdict::Yes && any_maybe {
                result = Verdict::MaybeExceededDepth;
            }
            result
        }
        IrNode::Ref(target) => eval_node(ctx, target, &doc, &path),
        IrNode::Annotated { inner, .. } => eval_node(ctx, inner, &doc, &path),
    };

    ctx.memo.insert(key, verdict);
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::SchemaIr;
    use std::cell::RefCell;
    use std::collections::HashMap as StdHashMap;

    struct MapResolver(RefCell<StdHashMap<Entity, Value>>);

    impl DocResolver for MapResolver {
        fn get(&self, doc: &Entity) -> Option<Value> {
            self.0.borrow().get(doc).cloned()
        }
    }

    fn resolver(docs: &[(&str, Value)]) -> MapResolver {
        MapResolver(RefCell::new(
            docs.iter().map(|(id, v)| (Entity::new(*id), v.clone())).collect(),
        ))
    }

    #[test]
    fn type_check_matches() {
        let mut ir = SchemaIr::new();
        let id = ir.compile(&serde_json::json!({"type": "string"})).unwrap();
        let r = resolver(&[("of:d", serde_json::json!("hi"))]);
        let outcome = evaluate(&ir, &r, id, &Entity::new("of:d"), &PathBuf::root());
        assert_eq!(outcome.verdict, Some(Verdict::Yes));
    }

    #[test]
    fn missing_required_prop_is_no() {
        let mut ir = SchemaIr::new();
        let id = ir
            .compile(&serde_json::json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"],
            }))
            .unwrap();
        let r = resolver(&[("of:d", serde_json::json!({}))]);
        let outcome = evaluate(&ir, &r, id, &Entity::new("of:d"), &PathBuf::root());
        assert_eq!(outcome.verdict, Some(Verdict::No));
    }

    #[test]
    fn link_is_followed_and_recorded() {
        let mut ir = SchemaIr::new();
        let id = ir.compile(&serde_json::json!({"type": "number"})).unwrap();
        let link = Link::inline(Entity::new("of:target"), PathBuf::root().child(Token::field("n")));
        let r = resolver(&[
            ("of:d", link.to_json()),
            ("of:target", serde_json::json!({"n": 42})),
        ]);
        let outcome = evaluate(&ir, &r, id, &Entity::new("of:d"), &PathBuf::root());
        assert_eq!(outcome.verdict, Some(Verdict::Yes));
        assert_eq!(outcome.link_edges.len(), 1);
        let edge = outcome.link_edges.iter().next().unwrap();
        assert_eq!(edge.to_doc, Entity::new("of:target"));
    }

    #[test]
    fn self_referential_schema_over_cyclic_doc_terminates() {
        let mut ir = SchemaIr::new();
        let schema = serde_json::json!({
            "$defs": {
                "node": {"type": "object", "properties": {"next": {"$ref": "#/$defs/node"}}}
            },
            "$ref": "#/$defs/node"
        });
        let id = ir.compile(&schema).unwrap();
        // A document whose "next" points back at itself: {"next": {}} is not
        // actually cyclic at the *document* level (no link), but the IR
        // graph itself is cyclic; evaluating it must still terminate.
        let r = resolver(&[("of:d", serde_json::json!({"next": {}}))]);
        let outcome = evaluate_with_limit(&ir, &r, id, &Entity::new("of:d"), &PathBuf::root(), 64);
        assert!(outcome.verdict.is_some());
    }

    #[test]
    fn any_of_picks_first_yes() {
        let mut ir = SchemaIr::new();
        let id = ir
            .compile(&serde_json::json!({"anyOf": [{"type": "string"}, {"type": "number"}]}))
            .unwrap();
        let r = resolver(&[("of:d", serde_json::json!(7))]);
        let outcome = evaluate(&ir, &r, id, &Entity::new("of:d"), &PathBuf::root());
        assert_eq!(outcome.verdict, Some(Verdict::Yes));
    }
}
