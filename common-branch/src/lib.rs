//! The branch/heads engine: per-document CRDT changes, named branches, and
//! point-in-time materialization (spec.md §4.3).

mod change;
mod doc;
mod engine;
mod error;
mod state;

pub use change::{ActorId, Change, WriteOp};
pub use doc::apply_ops;
pub use engine::{ApplyOutcome, BranchEngine, Timestamp, DEFAULT_SNAPSHOT_CADENCE};
pub use error::{BranchError, ChangeRejection, Result};
pub use state::{BranchState, Version};
