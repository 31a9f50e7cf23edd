//! `Runtime` wires the layered crates of this workspace (path codec,
//! content-addressed store, branch/heads engine, transaction processor,
//! schema evaluator, subscription engine, reactive cells, scheduler and
//! recipe runner) into a single context a host embeds (spec.md §9
//! "global singletons -> explicit runtime context"). No process-wide
//! state lives outside a `Runtime` instance except the `sled::Db` handle
//! it owns.

pub mod config;
mod error;
#[cfg(test)]
mod signer;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
#[cfg(test)]
pub use signer::{Ed25519Signer, Signer};

use common_branch::BranchEngine;
use common_cell::Cell;
use common_path::{Entity, Space};
use common_runner::{FunctionCache, ModuleRegistry, ProcessRunner};
use common_scheduler::Scheduler;
use common_subscribe::{OutboundMessage, Query, Version};
use common_tx::TxProcessor;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Initializes tracing: a `LogTracer` bridge for the `log` facade, an
/// `EnvFilter` defaulting to `info`, and panics routed through the
/// subscriber. Safe to call more than once; later calls are no-ops.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_log::LogTracer::init().ok();
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_span_events(
                tracing_subscriber::fmt::format::FmtSpan::ACTIVE | tracing_subscriber::fmt::format::FmtSpan::CLOSE,
            )
            .with_env_filter(EnvFilter::new(env))
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
        log_panics::init();
    });
}

/// The runtime context embedding hosts construct once and thread through
/// everything else: one `sled::Db`, the branch/tx engines built on top of
/// it, and the module/function registries recipe runs draw on.
pub struct Runtime {
    db: sled::Db,
    config: RuntimeConfig,
    branches: Arc<BranchEngine>,
    processor: Arc<TxProcessor>,
    scheduler: Arc<Mutex<Scheduler>>,
    registry: Arc<ModuleRegistry>,
    functions: Arc<FunctionCache>,
}

impl Runtime {
    /// Opens (or creates) a durable runtime backed by the `sled::Db` at
    /// `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        init_tracing();
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// An in-memory runtime for tests and short-lived sessions, mirroring
    /// `tlfs::Migrate::memory`.
    pub fn memory() -> Result<Self> {
        init_tracing();
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let branches = Arc::new(BranchEngine::new(db.clone())?);
        let processor = Arc::new(TxProcessor::new(branches.clone(), db.clone())?);
        let scheduler = Arc::new(Mutex::new(Scheduler::new()));
        let registry = Arc::new(ModuleRegistry::new());
        let functions = Arc::new(FunctionCache::new());
        Ok(Self { db, config: RuntimeConfig::from_env(), branches, processor, scheduler, registry, functions })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn branches(&self) -> &Arc<BranchEngine> {
        &self.branches
    }

    pub fn processor(&self) -> &Arc<TxProcessor> {
        &self.processor
    }

    pub fn scheduler(&self) -> &Arc<Mutex<Scheduler>> {
        &self.scheduler
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn functions(&self) -> &Arc<FunctionCache> {
        &self.functions
    }

    /// Opens a reactive cell view rooted at `root` on `branch` (spec.md
    /// §4.7).
    pub fn cell(&self, space: Space, branch: impl Into<String>, root: Entity) -> Cell {
        Cell::new(self.branches.clone(), space, branch, root)
    }

    /// A recipe/process-cell runner driving `branch` as `actor_id`
    /// (spec.md §4.9). Cheap to construct; callers typically keep one per
    /// logical worker.
    pub fn process_runner(&self, branch: impl Into<String>, actor_id: impl Into<String>) -> ProcessRunner {
        ProcessRunner::new(
            self.branches.clone(),
            self.processor.clone(),
            self.scheduler.clone(),
            self.registry.clone(),
            self.functions.clone(),
            branch,
            actor_id,
        )
    }

    /// The underlying `sled::Db` handle, for callers that need to open
    /// additional trees of their own.
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    /// Registers `query` for `client_id` against `space`'s subscription
    /// engine (spec.md §4.6). Subscription state lives on `TxProcessor`,
    /// one engine per space, so every commit can drive it directly; this
    /// is a thin pass-through for callers that only hold a `Runtime`.
    pub fn subscribe(&self, space: &Space, client_id: &str, query: Query, at_version: Version) {
        self.processor.subscribe(space, client_id, query, at_version);
    }

    pub fn unsubscribe(&self, space: &Space, client_id: &str, query_id: &str) {
        self.processor.unsubscribe(space, client_id, query_id);
    }

    /// Acknowledges a delivery for a client (spec.md §4.6 `ack`).
    pub fn ack(&self, space: &Space, client_id: &str, id: u64) {
        self.processor.ack(space, client_id, id);
    }

    /// Pending (unacked) outbound messages for a client in `space`.
    pub fn pending_for(&self, space: &Space, client_id: &str) -> Vec<OutboundMessage> {
        self.processor.pending_for(space, client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_runtime_opens_and_wires_every_layer() {
        let runtime = Runtime::memory().unwrap();
        let space = Space::new("did:test:alice");
        let root = Entity::new("of:root");
        let cell = runtime.cell(space, "main", root);
        assert!(cell.get().is_null());
    }

    #[test]
    fn config_reads_defaults() {
        let runtime = Runtime::memory().unwrap();
        assert_eq!(runtime.config().toolshed_api_url, "http://localhost:8000");
    }

    #[test]
    fn process_runner_is_constructible_from_runtime_handles() {
        let runtime = Runtime::memory().unwrap();
        let _runner = runtime.process_runner("main", "actor-1");
    }

    #[test]
    fn a_committed_write_reaches_a_subscribed_client() {
        let runtime = Runtime::memory().unwrap();
        let space = Space::new("did:test:alice");
        let root = Entity::new("of:root");
        let ir_id = runtime
            .processor()
            .schema_ir()
            .lock()
            .unwrap()
            .compile(&serde_json::json!({"type": "object"}))
            .unwrap();
        runtime.subscribe(
            &space,
            "client-a",
            Query {
                query_id: "q1".into(),
                doc_entry_point: root.clone(),
                path: common_path::PathBuf::root(),
                ir_id,
            },
            Version { epoch: 0, branch: "main".into() },
        );

        let tx = Arc::new(common_cell::CellTx::open(
            runtime.processor().clone(),
            runtime.branches().clone(),
            space.clone(),
            "main",
            "actor-a",
        ));
        runtime.cell(space.clone(), "main", root).with_tx(tx.clone()).set(serde_json::json!({"a": 1})).unwrap();
        tx.commit().unwrap();

        assert!(!runtime.pending_for(&space, "client-a").is_empty());
    }
}
