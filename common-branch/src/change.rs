//! Changes: opaque per-document CRDT blobs carrying a deterministic write
//! set plus the lamport/deps metadata the branch engine needs to order and
//! validate them (spec.md §3).
//!
//! The real system's wire format for a change's payload is an
//! implementation detail of the document CRDT (automerge-style) and is
//! explicitly opaque to everything outside the runtime that produced it
//! (spec.md §3: "Change: Opaque binary blob"). This crate represents that
//! payload concretely as an ordered list of [`WriteOp`]s so the branch
//! engine can actually replay and materialize documents; callers that only
//! need the envelope (hash/deps/seq/actor) never need to look inside it.

use common_path::{Path, PathBuf};
use common_store::Digest;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One write within a change: set a value at a path, or delete it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Assign `value` at `path`, creating intermediate objects/arrays as
    /// needed.
    Set { path: PathBuf, value: Value },
    /// Remove the value at `path`.
    Delete { path: PathBuf },
}

impl WriteOp {
    /// The path this op touches.
    pub fn path(&self) -> Path<'_> {
        match self {
            WriteOp::Set { path, .. } => path.as_path(),
            WriteOp::Delete { path } => path.as_path(),
        }
    }
}

/// The actor identifier a change is attributed to (a peer/session id).
pub type ActorId = String;

/// A CRDT change: an ordered batch of [`WriteOp`]s plus causal metadata.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// The actor (peer) that authored this change.
    pub actor_id: ActorId,
    /// Lamport sequence number, monotone per (branch, actor).
    pub seq: u64,
    /// Changes this one causally depends on.
    pub deps: Vec<Digest>,
    /// The writes this change applies.
    pub ops: Vec<WriteOp>,
}

impl Change {
    /// Builds a new change.
    pub fn new(actor_id: impl Into<ActorId>, seq: u64, deps: Vec<Digest>, ops: Vec<WriteOp>) -> Self {
        Self {
            actor_id: actor_id.into(),
            seq,
            deps,
            ops,
        }
    }

    /// Serializes the change to its canonical on-the-wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Change always serializes")
    }

    /// Parses a change back from its canonical bytes.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// This change's content hash, i.e. its identity in the change DAG.
    pub fn hash(&self) -> Digest {
        Digest::of(&self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let change = Change::new(
            "actor-1",
            3,
            vec![Digest::of(b"dep")],
            vec![WriteOp::Set {
                path: PathBuf::root().child(common_path::Token::field("a")),
                value: Value::from(1),
            }],
        );
        let bytes = change.to_bytes();
        let back = Change::from_bytes(&bytes).unwrap();
        assert_eq!(change, back);
        assert_eq!(change.hash(), back.hash());
    }

    #[test]
    fn identical_changes_hash_identically() {
        let make = || Change::new("a", 1, vec![], vec![]);
        assert_eq!(make().hash(), make().hash());
    }
}
