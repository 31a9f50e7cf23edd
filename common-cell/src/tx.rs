//! An open transaction a [`crate::Cell`] can bind to for writes
//! (spec.md §4.7 `withTx`).
//!
//! Accumulates per-entity write ops across however many cell writes
//! happen before `commit`, then submits them as one [`TxRequest`] so
//! sibling writes to different entities succeed or fail independently
//! (spec.md §4.4 step 3) while reads stay consistent with the heads seen
//! when each entity was first touched.

use common_branch::{BranchEngine, Change, WriteOp};
use common_path::{Entity, Space};
use common_store::Digest;
use common_tx::{Result as TxResult, TxProcessor, TxReceipt, TxRequest, WriteEntry};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

struct PendingEntry {
    base_heads: BTreeSet<Digest>,
    ops: Vec<WriteOp>,
}

/// A write-side transaction bound to one space and branch.
pub struct CellTx {
    processor: Arc<TxProcessor>,
    branches: Arc<BranchEngine>,
    space: Space,
    branch: String,
    actor_id: String,
    pending: Mutex<HashMap<Entity, PendingEntry>>,
}

impl CellTx {
    pub fn open(
        processor: Arc<TxProcessor>,
        branches: Arc<BranchEngine>,
        space: Space,
        branch: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            processor,
            branches,
            space,
            branch: branch.into(),
            actor_id: actor_id.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Queues `ops` against `entity`, snapshotting its current heads as
    /// this write's base heads the first time the entity is touched.
    pub fn stage(&self, entity: &Entity, ops: Vec<WriteOp>) -> TxResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pending = self.pending.lock();
        let entry = match pending.get_mut(entity) {
            Some(entry) => entry,
            None => {
                let state = self.branches.get_branch_state(&self.space, entity, &self.branch)?;
                pending.insert(
                    entity.clone(),
                    PendingEntry {
                        base_heads: state.heads,
                        ops: Vec::new(),
                    },
                );
                pending.get_mut(entity).expect("just inserted")
            }
        };
        entry.ops.extend(ops);
        Ok(())
    }

    /// Submits every staged entity as one transaction.
    pub fn commit(&self) -> TxResult<TxReceipt> {
        let mut pending = self.pending.lock();
        let mut writes = Vec::with_capacity(pending.len());
        for (entity, entry) in pending.drain() {
            let seq = self
                .branches
                .next_actor_seq(&self.space, &entity, &self.branch, &self.actor_id)?;
            let change = Change::new(self.actor_id.clone(), seq, entry.base_heads.iter().copied().collect(), entry.ops);
            writes.push(WriteEntry {
                doc_id: entity,
                branch: self.branch.clone(),
                base_heads: entry.base_heads,
                changes: vec![change],
                allow_server_merge: false,
            });
        }
        let req = TxRequest {
            space_id: self.space.clone(),
            tx_id: None,
            reads: vec![],
            writes,
        };
        self.processor.submit(req)
    }
}
