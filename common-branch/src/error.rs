//! Error taxonomy for the branch/heads engine (spec.md §7).

use common_store::Digest;
use thiserror::Error;

/// A single submitted change being rejected (spec.md §7 `WriteConflict`).
/// The write entry containing it is rejected; sibling entries in the same
/// transaction may still succeed (spec.md §4.4 step 3).
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ChangeRejection {
    /// The same change hash appears twice within one write.
    #[error("duplicate change hash {0} within write")]
    DuplicateHash(Digest),
    /// A dependency is absent from the rolling head set.
    #[error("change {0} depends on missing change {1}")]
    MissingDep(Digest, Digest),
    /// The change's lamport seq is not strictly greater than the actor's
    /// last applied seq on this branch.
    #[error("non-monotone lamport seq {seq} for actor {actor} (last seen {last_seen})")]
    NonMonotoneLamport {
        /// The offending actor.
        actor: String,
        /// The submitted seq.
        seq: u64,
        /// The highest seq previously recorded for this actor.
        last_seen: u64,
    },
    /// `baseHeads` didn't match current heads and server-merge wasn't
    /// permitted.
    #[error("base heads mismatch: submitted writer is behind current branch state")]
    BaseHeadsMismatch,
}

/// Branch-engine level errors.
#[derive(Debug, Error)]
pub enum BranchError {
    /// The requested branch does not exist.
    #[error("branch {0:?} not found for document {1}")]
    NotFound(String, String),
    /// One or more changes in a write were rejected; the whole write entry
    /// is rejected (spec.md §4.4 step 3).
    #[error("write rejected: {0:?}")]
    WriteRejected(Vec<ChangeRejection>),
    /// Post-commit materialization disagreed with the expected invariant.
    #[error("invariant failure: {0}")]
    InvariantFailure(String),
    #[error(transparent)]
    Store(#[from] common_store::StoreError),
    #[error(transparent)]
    Backend(#[from] sled::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, BranchError>;
