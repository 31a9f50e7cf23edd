//! Branch state: heads, sequence numbers, epoch, lineage (spec.md §3, §4.3).

use common_store::{merkle_of_sorted, Digest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A named linear view over a document's change DAG.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BranchState {
    /// Branch name, unique within a document.
    pub branch_id: String,
    /// The maximal antichain of the change DAG reachable on this branch.
    pub heads: BTreeSet<Digest>,
    /// Monotone count of changes applied to this branch.
    pub seq_no: u64,
    /// The last transaction id that advanced this branch.
    pub epoch: u64,
    /// Lineage: the branch this one was created `from`, if any.
    pub parent_branch_id: Option<String>,
    /// Whether the branch has been closed.
    pub closed: bool,
    /// If closed via a merge, the branch it was merged into.
    pub merged_into: Option<String>,
}

impl BranchState {
    /// A fresh, empty branch with no parent.
    pub fn new(branch_id: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            heads: BTreeSet::new(),
            seq_no: 0,
            epoch: 0,
            parent_branch_id: None,
            closed: false,
            merged_into: None,
        }
    }

    /// The merkle root of the sorted heads set (spec.md §3: `rootRef`).
    pub fn root_ref(&self) -> Digest {
        merkle_of_sorted(self.heads.iter().copied().collect())
    }
}

/// A point-in-time coordinate: `{epoch, branch}` (spec.md §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Version {
    /// Transaction id to materialize up to (inclusive).
    pub epoch: u64,
    /// unused placeholder kept for API symmetry with spec.md's
    /// `{epoch, branch}` shape; the branch name itself is passed alongside
    /// a `Version` rather than folded into it, since every branch API here
    /// is already scoped to one branch.
    pub branch: (),
}

impl Version {
    /// Builds a version pinned to `epoch`.
    pub fn at_epoch(epoch: u64) -> Self {
        Self { epoch, branch: () }
    }

    /// The version representing "current" (no upper bound).
    pub fn head() -> Self {
        Self {
            epoch: u64::MAX,
            branch: (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_ref_is_order_independent() {
        let mut a = BranchState::new("main");
        a.heads.insert(Digest::of(b"x"));
        a.heads.insert(Digest::of(b"y"));
        let mut b = a.clone();
        b.heads = BTreeSet::new();
        b.heads.insert(Digest::of(b"y"));
        b.heads.insert(Digest::of(b"x"));
        assert_eq!(a.root_ref(), b.root_ref());
    }
}
