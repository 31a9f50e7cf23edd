//! The transaction processor (spec.md §4.4): atomic read-set validation
//! plus per-write conflict detection, under a single-writer lock per space.

use crate::error::{Result, TxError};
use crate::invariant::InvariantRegistry;
use crate::resolver::TxDocResolver;
use crate::types::{Digests, ReadAssertion, TxReceipt, TxRequest, WriteEntry, WriteResult, WriteStatus};
use common_branch::{BranchEngine, WriteOp};
use common_path::Space;
use common_schema::{DocResolver, SchemaIr};
use common_store::{merkle_of_sorted, Digest};
use common_subscribe::{Delta, EngineEvent, OutboundMessage, Query, SubscribeEngine, Version};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// The transaction processor. One instance serves an entire runtime; it
/// hands out a per-space lock so writers to different spaces never block
/// each other (spec.md §5: "per-space exclusive write lock").
pub struct TxProcessor {
    branches: Arc<BranchEngine>,
    space_locks: Mutex<HashMap<Space, Arc<Mutex<()>>>>,
    next_tx_id: AtomicU64,
    tx_chain: sled::Tree,
    invariants: InvariantRegistry,
    /// Schema pool shared by every space's subscription engine (spec.md
    /// §4.5/§4.6): one pool per processor, not per space, since compiled
    /// schemas are content-addressed and query-independent of which space
    /// they're evaluated against.
    schema_ir: Arc<StdMutex<SchemaIr>>,
    /// One subscription engine per memory space (spec.md §4.6 "one
    /// instance per memory space"), built lazily on first use. Resolves
    /// documents against the `"main"` branch, matching this workspace's
    /// other space-wide simplifications (see DESIGN.md).
    subscriptions: StdMutex<HashMap<Space, SubscribeEngine>>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

impl TxProcessor {
    /// Builds a processor over a shared [`BranchEngine`] and the `sled::Db`
    /// used for the stub tx-chain record (spec.md §4.4 step 7).
    pub fn new(branches: Arc<BranchEngine>, db: sled::Db) -> Result<Self> {
        Ok(Self {
            branches,
            space_locks: Mutex::new(HashMap::new()),
            next_tx_id: AtomicU64::new(1),
            tx_chain: db.open_tree("tx")?,
            invariants: InvariantRegistry::new(),
            schema_ir: Arc::new(StdMutex::new(SchemaIr::new())),
            subscriptions: StdMutex::new(HashMap::new()),
        })
    }

    /// An in-memory processor for tests.
    pub fn memory(branches: Arc<BranchEngine>) -> Result<Self> {
        Self::new(branches, sled::Config::new().temporary(true).open()?)
    }

    /// Registers a [`crate::TxInvariant`], run after every commit.
    pub fn with_invariant(mut self, invariant: Box<dyn crate::TxInvariant>) -> Self {
        self.invariants.register(invariant);
        self
    }

    fn lock_for(&self, space: &Space) -> Arc<Mutex<()>> {
        let mut locks = self.space_locks.lock();
        locks
            .entry(space.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The compiled schema pool backing every space's subscription engine.
    /// Callers compile query schemas into this pool so their `IrId`s are
    /// valid for [`TxProcessor::subscribe`].
    pub fn schema_ir(&self) -> &Arc<StdMutex<SchemaIr>> {
        &self.schema_ir
    }

    fn with_subscribe_engine<R>(&self, space: &Space, f: impl FnOnce(&mut SubscribeEngine) -> R) -> R {
        let mut engines = self.subscriptions.lock().expect("subscriptions lock poisoned");
        let engine = engines.entry(space.clone()).or_insert_with(|| {
            let resolver: Arc<dyn DocResolver> = Arc::new(TxDocResolver::new(self.branches.clone(), space.clone(), "main"));
            SubscribeEngine::new(self.schema_ir.clone(), resolver)
        });
        f(engine)
    }

    /// Registers `query` for `client_id` against `space`'s subscription
    /// engine (spec.md §4.6 `subscribe`).
    pub fn subscribe(&self, space: &Space, client_id: &str, query: Query, at_version: Version) {
        self.with_subscribe_engine(space, |engine| engine.subscribe(client_id, query, at_version));
    }

    pub fn unsubscribe(&self, space: &Space, client_id: &str, query_id: &str) {
        self.with_subscribe_engine(space, |engine| engine.unsubscribe(client_id, query_id));
    }

    /// Acknowledges a delivery for a client (spec.md §4.6 `ack`).
    pub fn ack(&self, space: &Space, client_id: &str, id: u64) {
        self.with_subscribe_engine(space, |engine| engine.ack(client_id, id));
    }

    /// Pending (unacked) outbound messages for a client in `space`.
    pub fn pending_for(&self, space: &Space, client_id: &str) -> Vec<OutboundMessage> {
        self.with_subscribe_engine(space, |engine| engine.pending_for(client_id))
    }

    /// Builds the post-commit [`Delta`] for one committed write: every
    /// `Set` op's path is a changed path, every `Delete` op's path a
    /// removed one, at a version keyed by this transaction's own id
    /// (`BranchEngine::upto_seq_no` already treats a tx id as an epoch
    /// boundary, so no separate timestamp-to-epoch lookup is needed).
    fn delta_for(write: &WriteEntry, tx_id: u64) -> Delta {
        let mut changed_paths = Vec::new();
        let mut removed_paths = Vec::new();
        for change in &write.changes {
            for op in &change.ops {
                match op {
                    WriteOp::Set { path, .. } => changed_paths.push(path.clone()),
                    WriteOp::Delete { path } => removed_paths.push(path.clone()),
                }
            }
        }
        Delta {
            doc: write.doc_id.clone(),
            changed_paths,
            removed_paths,
            at_version: Version {
                epoch: tx_id,
                branch: write.branch.clone(),
            },
        }
    }

    /// Submits a transaction atomically against its space's write lock.
    pub fn submit(&self, req: TxRequest) -> Result<TxReceipt> {
        let lock = self.lock_for(&req.space_id);
        let _guard = lock.lock();

        self.validate_reads(&req.space_id, &req.reads)?;

        let tx_id = req
            .tx_id
            .unwrap_or_else(|| self.next_tx_id.fetch_add(1, Ordering::SeqCst));
        let committed_at = now_millis();

        let mut results = Vec::with_capacity(req.writes.len());
        let mut conflicts = Vec::new();
        let mut base_heads_digests = Vec::new();
        let mut change_digests = Vec::new();
        let mut change_count = 0u64;

        for write in &req.writes {
            base_heads_digests.extend(write.base_heads.iter().copied());
            change_digests.extend(write.changes.iter().map(|c| c.hash()));
            change_count += write.changes.len() as u64;

            match self.branches.apply_changes(
                &req.space_id,
                &write.doc_id,
                &write.branch,
                &write.base_heads,
                write.changes.clone(),
                write.allow_server_merge,
                tx_id,
                committed_at,
            ) {
                Ok(outcome) => {
                    results.push(WriteResult {
                        doc_id: write.doc_id.clone(),
                        branch: write.branch.clone(),
                        status: WriteStatus::Committed,
                        new_heads: Some(outcome.new_heads),
                        applied: Some(outcome.applied),
                        reason: None,
                    });

                    let delta = Self::delta_for(write, tx_id);
                    let events: Vec<EngineEvent> =
                        self.with_subscribe_engine(&req.space_id, |engine| engine.apply_delta(&delta));
                    if !events.is_empty() {
                        debug!(doc = %write.doc_id, branch = %write.branch, events = events.len(), "subscriptions re-evaluated after commit");
                    }
                }
                Err(common_branch::BranchError::WriteRejected(rejections)) => {
                    let reason = format!("{rejections:?}");
                    warn!(doc = %write.doc_id, branch = %write.branch, %reason, "write entry rejected");
                    conflicts.push(reason.clone());
                    results.push(WriteResult {
                        doc_id: write.doc_id.clone(),
                        branch: write.branch.clone(),
                        status: WriteStatus::Rejected,
                        new_heads: None,
                        applied: None,
                        reason: Some(reason),
                    });
                }
                Err(other) => return Err(other.into()),
            }
        }

        if let Err((name, reason)) = self.invariants.check_all(&req.space_id, &results) {
            return Err(TxError::InvariantFailure { name, reason });
        }

        let digests = Digests {
            base_heads_root: merkle_of_sorted(base_heads_digests),
            changes_root: merkle_of_sorted(change_digests),
            change_count,
        };

        self.record_tx_chain(tx_id, &digests)?;
        info!(tx_id, committed = results.iter().filter(|r| r.status == WriteStatus::Committed).count(), "transaction committed");

        Ok(TxReceipt {
            tx_id,
            results,
            conflicts,
            digests,
        })
    }

    fn validate_reads(&self, space: &Space, reads: &[ReadAssertion]) -> Result<()> {
        for read in reads {
            let state = self.branches.get_branch_state(space, &read.doc_id, &read.branch)?;
            if state.heads != read.heads {
                return Err(TxError::ReadConflict {
                    doc_id: read.doc_id.to_string(),
                    branch: read.branch.clone(),
                });
            }
        }
        Ok(())
    }

    /// Persists the stub tx-chain record `(tx_id, prev_tx_hash, tx_body_hash,
    /// tx_hash, ...)` (spec.md §4.4 step 7, §6 `tx` table). Signatures and
    /// the UCAN JWT are left empty: identity/signing is out of scope here
    /// (spec.md §9 Non-goals) and is wired up by `common-runtime`'s
    /// `Signer` when present.
    fn record_tx_chain(&self, tx_id: u64, digests: &Digests) -> Result<()> {
        let prev_tx_hash = if tx_id == 0 {
            Digest::of(b"genesis")
        } else {
            self.tx_chain
                .get((tx_id - 1).to_be_bytes())?
                .map(|bytes| {
                    let record: TxChainRecord = serde_json::from_slice(&bytes).expect("valid tx chain record");
                    record.tx_hash
                })
                .unwrap_or_else(|| Digest::of(b"genesis"))
        };
        let tx_body_hash = merkle_of_sorted(vec![
            digests.base_heads_root,
            digests.changes_root,
            Digest::of(&digests.change_count.to_be_bytes()),
        ]);
        let tx_hash = merkle_of_sorted(vec![prev_tx_hash, tx_body_hash]);
        let record = TxChainRecord {
            tx_id,
            prev_tx_hash,
            tx_body_hash,
            tx_hash,
            signatures: Vec::new(),
            ucan_jwt: None,
        };
        self.tx_chain
            .insert(tx_id.to_be_bytes(), serde_json::to_vec(&record)?.as_slice())?;
        Ok(())
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct TxChainRecord {
    tx_id: u64,
    prev_tx_hash: Digest,
    tx_body_hash: Digest,
    tx_hash: Digest,
    signatures: Vec<String>,
    ucan_jwt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WriteEntry;
    use common_branch::{Change, WriteOp};
    use common_path::{Entity, PathBuf, Token};
    use std::collections::BTreeSet;

    fn setup() -> (TxProcessor, Space, Entity) {
        let branches = Arc::new(BranchEngine::memory().unwrap());
        (
            TxProcessor::memory(branches).unwrap(),
            Space::new("did:key:zSpace"),
            Entity::new("of:doc1"),
        )
    }

    #[test]
    fn fresh_write_commits_and_advances_heads() {
        let (proc, space, doc) = setup();
        let change = Change::new(
            "actor-a",
            1,
            vec![],
            vec![WriteOp::Set {
                path: PathBuf::root().child(Token::field("a")),
                value: serde_json::json!(1),
            }],
        );
        let req = TxRequest {
            space_id: space,
            tx_id: None,
            reads: vec![],
            writes: vec![WriteEntry {
                doc_id: doc,
                branch: "main".to_string(),
                base_heads: BTreeSet::new(),
                changes: vec![change],
                allow_server_merge: false,
            }],
        };
        let receipt = proc.submit(req).unwrap();
        assert_eq!(receipt.results.len(), 1);
        assert_eq!(receipt.results[0].status, WriteStatus::Committed);
        assert_eq!(receipt.digests.change_count, 1);
    }

    #[test]
    fn stale_read_set_aborts_whole_tx() {
        let (proc, space, doc) = setup();
        let req = TxRequest {
            space_id: space.clone(),
            tx_id: None,
            reads: vec![ReadAssertion {
                doc_id: doc,
                branch: "main".to_string(),
                heads: [Digest::of(b"stale")].into_iter().collect(),
            }],
            writes: vec![],
        };
        let err = proc.submit(req).unwrap_err();
        assert!(matches!(err, TxError::ReadConflict { .. }));
    }

    #[test]
    fn rejected_write_entry_does_not_abort_others() {
        let (proc, space, doc) = setup();
        let doc2 = Entity::new("of:doc2");
        let bad = Change::new("actor-a", 1, vec![Digest::of(b"missing")], vec![]);
        let good = Change::new(
            "actor-a",
            1,
            vec![],
            vec![WriteOp::Set {
                path: PathBuf::root().child(Token::field("a")),
                value: serde_json::json!(1),
            }],
        );
        let req = TxRequest {
            space_id: space,
            tx_id: None,
            reads: vec![],
            writes: vec![
                WriteEntry {
                    doc_id: doc,
                    branch: "main".to_string(),
                    base_heads: BTreeSet::new(),
                    changes: vec![bad],
                    allow_server_merge: false,
                },
                WriteEntry {
                    doc_id: doc2,
                    branch: "main".to_string(),
                    base_heads: BTreeSet::new(),
                    changes: vec![good],
                    allow_server_merge: false,
                },
            ],
        };
        let receipt = proc.submit(req).unwrap();
        assert_eq!(receipt.results[0].status, WriteStatus::Rejected);
        assert_eq!(receipt.results[1].status, WriteStatus::Committed);
        assert_eq!(receipt.conflicts.len(), 1);
    }

    #[test]
    fn committed_write_delivers_a_doc_update_to_a_subscriber() {
        let (proc, space, doc) = setup();
        let ir_id = proc
            .schema_ir()
            .lock()
            .unwrap()
            .compile(&serde_json::json!({"type": "object"}))
            .unwrap();
        proc.subscribe(
            &space,
            "client-a",
            Query {
                query_id: "q1".into(),
                doc_entry_point: doc.clone(),
                path: PathBuf::root(),
                ir_id,
            },
            Version { epoch: 0, branch: "main".into() },
        );

        let change = Change::new(
            "actor-a",
            1,
            vec![],
            vec![WriteOp::Set {
                path: PathBuf::root().child(Token::field("a")),
                value: serde_json::json!(1),
            }],
        );
        let req = TxRequest {
            space_id: space.clone(),
            tx_id: None,
            reads: vec![],
            writes: vec![WriteEntry {
                doc_id: doc,
                branch: "main".to_string(),
                base_heads: BTreeSet::new(),
                changes: vec![change],
                allow_server_merge: false,
            }],
        };
        proc.submit(req).unwrap();

        let pending = proc.pending_for(&space, "client-a");
        assert!(!pending.is_empty(), "expected at least one delivery after commit");
    }
}
