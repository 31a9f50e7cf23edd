//! Process cell lifecycle and recipe/node instantiation (spec.md §4.9).

mod error;
mod function;
mod node;
mod process;
mod registry;
mod types;

pub use error::{Result, RunnerError};
pub use function::{FunctionCache, JsFunction};
pub use node::{JsNodeAction, PassthroughAction};
pub use process::{ProcessRunner, RunHandle, STREAM_MARKER};
pub use registry::{ModuleRegistry, RawContext, RawFactory};
pub use types::{ImplementationRef, InitialState, Module, Node, Recipe};
