//! Error taxonomy for the fact store (spec.md §7).

use crate::Digest;
use thiserror::Error;

/// Errors surfaced by [`crate::CasStore`] and [`crate::FactStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Re-putting bytes that already exist under the same digest. This is
    /// not a failure: the CAS is idempotent and the put is a no-op, but
    /// callers that want to distinguish "already there" from "freshly
    /// written" can match on it.
    #[error("blob {0} already exists (benign, put was a no-op)")]
    AlreadyExistsBenign(Digest),
    /// The requested digest is not present in the CAS.
    #[error("blob {0} not found")]
    NotFound(Digest),
    /// The underlying storage engine failed.
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, StoreError>;
