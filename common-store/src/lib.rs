//! Content-addressed fact store (spec.md §4.2).
//!
//! Facts are immutable assertions `{the, of, is, cause}` identified by the
//! blake3 hash of their canonical bytes. A secondary index tracks the
//! current lineage tip per `(space, entity, attribute)` so readers don't
//! need to replay the whole causal chain to find the latest value.

mod cas;
mod digest;
mod error;
mod fact;
mod store;

pub use cas::{CasStore, SledCas};
pub use digest::{merkle_of_sorted, Digest};
pub use error::{Result, StoreError};
pub use fact::{Attribute, Fact, ATTR_JSON, ATTR_LABEL};
pub use store::FactStore;
