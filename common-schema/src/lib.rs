//! JSON-Schema IR compiler and evaluator (spec.md §4.5): cyclic-safe
//! compilation via two-phase `$ref` aliasing, and a provenance-tracking
//! evaluator with link-following and a bounded visit budget.

mod compiler;
mod error;
mod evaluator;
mod ir;

pub use compiler::SchemaIr;
pub use error::{Result, SchemaError};
pub use evaluator::{
    evaluate, evaluate_with_limit, DocResolver, EvalKey, EvalOutcome, LinkEdge, Verdict,
    DEFAULT_VISIT_LIMIT,
};
pub use ir::{Additional, IrId, IrNode, JsonType};
