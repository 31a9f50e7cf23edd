//! Transaction-processor error taxonomy (spec.md §7).

use thiserror::Error;

/// Errors that abort an entire transaction (as opposed to one write entry
/// within it, which is reported per-entry on the receipt instead).
#[derive(Debug, Error)]
pub enum TxError {
    /// A read-set assertion disagreed with the branch's current heads
    /// (spec.md §7 `ReadConflict`): the whole tx aborts, client retries
    /// with fresh heads.
    #[error("read conflict on {doc_id:?}/{branch}: expected heads did not match current state")]
    ReadConflict { doc_id: String, branch: String },
    /// A registered [`crate::TxInvariant`] rejected the post-commit state.
    #[error("invariant {name} failed: {reason}")]
    InvariantFailure { name: String, reason: String },
    #[error(transparent)]
    Branch(#[from] common_branch::BranchError),
    #[error(transparent)]
    Store(#[from] common_store::StoreError),
    #[error(transparent)]
    Backend(#[from] sled::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TxError>;
