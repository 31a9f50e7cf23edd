//! Wire types for transaction submission (spec.md §6).

use common_branch::Change;
use common_path::{Entity, Space};
use common_store::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A read-set assertion: the writer's view of `(docId, branch)`'s heads.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReadAssertion {
    pub doc_id: Entity,
    pub branch: String,
    pub heads: BTreeSet<Digest>,
}

/// One per-document write within a transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteEntry {
    pub doc_id: Entity,
    pub branch: String,
    pub base_heads: BTreeSet<Digest>,
    pub changes: Vec<Change>,
    #[serde(default)]
    pub allow_server_merge: bool,
}

/// A transaction submission: an atomic read-set check plus a batch of
/// per-document writes (spec.md §4.4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxRequest {
    pub space_id: Space,
    /// Caller-assigned id; the processor mints one if absent.
    pub tx_id: Option<u64>,
    pub reads: Vec<ReadAssertion>,
    pub writes: Vec<WriteEntry>,
}

/// The outcome of one [`WriteEntry`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum WriteStatus {
    Committed,
    Rejected,
}

/// The result of applying (or rejecting) one [`WriteEntry`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteResult {
    pub doc_id: Entity,
    pub branch: String,
    pub status: WriteStatus,
    pub new_heads: Option<BTreeSet<Digest>>,
    pub applied: Option<Vec<Digest>>,
    pub reason: Option<String>,
}

/// Audit digests carried on every receipt; not used for validation
/// (spec.md §4.4).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Digests {
    pub base_heads_root: Digest,
    pub changes_root: Digest,
    pub change_count: u64,
}

/// The response to a [`TxRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_id: u64,
    pub results: Vec<WriteResult>,
    pub conflicts: Vec<String>,
    pub digests: Digests,
}
