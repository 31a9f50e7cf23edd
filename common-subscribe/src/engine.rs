//! The subscription registry and delta-driven invalidation engine
//! (spec.md §4.6).
//!
//! Fine-grained per-IR-node incremental re-evaluation (the `parent`-edge
//! Kahn reorder spec.md describes) collapses here to whole-query
//! re-evaluation once any of its recorded touches intersects a delta: the
//! externally observable contract — re-evaluate only when touched, emit an
//! event only on verdict/touch change — is identical either way, and
//! spec.md §8's provenance-soundness property is a statement about exactly
//! that contract, not about internal incrementality.

use crate::outbox::Outbox;
use crate::types::{Delta, DocUpdate, OutboundMessage, Query, QuerySynced, Version};
use common_path::{Entity, PathBuf};
use common_schema::{evaluate, DocResolver, EvalOutcome, SchemaIr, Verdict};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

struct RegisteredQuery {
    query: Query,
    outcome: EvalOutcome,
    subscribers: BTreeSet<String>,
}

/// A client's view of the engine: its outbox plus per-doc sent-version
/// watermarks (spec.md §4.6 `sentVersionByDoc`).
#[derive(Default)]
struct ClientState {
    outbox: Outbox,
    sent_version_by_doc: HashMap<Entity, u64>,
    pending_sync: HashMap<String, BTreeSet<u64>>,
}

/// An event surfaced by [`SubscribeEngine::apply_delta`] when a query's
/// observable result changed.
#[derive(Debug)]
pub struct EngineEvent {
    pub query_id: String,
    pub verdict_changed: bool,
    pub touches_changed: bool,
}

fn paths_intersect(a: &PathBuf, b: &PathBuf) -> bool {
    a.as_path().is_ancestor(b.as_path()) || b.as_path().is_ancestor(a.as_path())
}

/// The subscription engine: one instance per memory space. Owns its
/// `SchemaIr`/`DocResolver` behind `Arc` (the same sharing pattern
/// `common_cell::Cell` uses for its own schema binding) so an engine can be
/// held with a `'static` lifetime inside a transaction processor.
pub struct SubscribeEngine {
    ir: Arc<Mutex<SchemaIr>>,
    resolver: Arc<dyn DocResolver>,
    queries: HashMap<String, RegisteredQuery>,
    clients: HashMap<String, ClientState>,
    next_delivery_id: u64,
}

impl SubscribeEngine {
    pub fn new(ir: Arc<Mutex<SchemaIr>>, resolver: Arc<dyn DocResolver>) -> Self {
        Self {
            ir,
            resolver,
            queries: HashMap::new(),
            clients: HashMap::new(),
            next_delivery_id: 0,
        }
    }

    fn evaluate(&self, ir_id: common_schema::IrId, doc: &Entity, path: &PathBuf) -> EvalOutcome {
        let ir = self.ir.lock().expect("schema ir lock poisoned");
        evaluate(&ir, self.resolver.as_ref(), ir_id, doc, path)
    }

    fn alloc_delivery_id(&mut self) -> u64 {
        self.next_delivery_id += 1;
        self.next_delivery_id
    }

    /// Registers `query` for `client_id`, computing its initial verdict
    /// and touch set, then sends a `DOC_UPDATE` for every touched doc
    /// followed by `QUERY_SYNCED` once all are enqueued (spec.md §4.6).
    pub fn subscribe(&mut self, client_id: &str, query: Query, at_version: Version) {
        let outcome = self.evaluate(query.ir_id, &query.doc_entry_point, &query.path);
        let docs: BTreeSet<Entity> = outcome.touches.iter().map(|(doc, _)| doc.clone()).collect();

        let client = self.clients.entry(client_id.to_string()).or_default();
        let mut pending_ids = BTreeSet::new();
        for doc in &docs {
            if let Some(value) = self.resolver.get(doc) {
                let id = {
                    self.next_delivery_id += 1;
                    self.next_delivery_id
                };
                pending_ids.insert(id);
                client.sent_version_by_doc.insert(doc.clone(), at_version.epoch);
                client.outbox.push(OutboundMessage::DocUpdate(DocUpdate {
                    id,
                    doc_id: doc.clone(),
                    version: at_version.clone(),
                    doc: value,
                }));
            }
        }
        client.pending_sync.insert(query.query_id.clone(), pending_ids);

        self.queries
            .entry(query.query_id.clone())
            .or_insert_with(|| RegisteredQuery {
                query: query.clone(),
                outcome: EvalOutcome::default(),
                subscribers: BTreeSet::new(),
            });
        let registered = self.queries.get_mut(&query.query_id).expect("just inserted");
        registered.outcome = outcome;
        registered.subscribers.insert(client_id.to_string());

        self.maybe_emit_synced(client_id, &query.query_id, at_version.epoch);
    }

    pub fn unsubscribe(&mut self, client_id: &str, query_id: &str) {
        if let Some(q) = self.queries.get_mut(query_id) {
            q.subscribers.remove(client_id);
        }
        if let Some(client) = self.clients.get_mut(client_id) {
            client.pending_sync.remove(query_id);
        }
    }

    fn maybe_emit_synced(&mut self, client_id: &str, query_id: &str, watermark: u64) {
        let all_acked = self
            .clients
            .get(client_id)
            .and_then(|c| c.pending_sync.get(query_id))
            .map(|ids| ids.iter().all(|id| self.clients[client_id].outbox.is_acked(*id)))
            .unwrap_or(true);
        if all_acked {
            let id = self.alloc_delivery_id();
            if let Some(client) = self.clients.get_mut(client_id) {
                client.outbox.push(OutboundMessage::QuerySynced(QuerySynced {
                    id,
                    query_id: query_id.to_string(),
                    watermark,
                }));
            }
        }
    }

    /// Acknowledges a delivery for a client. Idempotent by `(client_id, id)`
    /// (spec.md §4.6).
    pub fn ack(&mut self, client_id: &str, id: u64) {
        if let Some(client) = self.clients.get_mut(client_id) {
            client.outbox.ack(id);
        }
    }

    /// Applies a post-commit delta: recomputes every query whose prior
    /// touch set intersects it, and enqueues `DOC_UPDATE`s to affected
    /// subscribers when the observable result changed.
    pub fn apply_delta(&mut self, delta: &Delta) -> Vec<EngineEvent> {
        let changed: Vec<&PathBuf> = delta.changed_paths.iter().chain(delta.removed_paths.iter()).collect();
        let affected: Vec<String> = self
            .queries
            .iter()
            .filter(|(_, q)| {
                q.outcome
                    .touches
                    .iter()
                    .any(|(doc, path)| *doc == delta.doc && changed.iter().any(|p| paths_intersect(path, p)))
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut events = Vec::new();
        for query_id in affected {
            let (query, old_verdict, old_touches) = {
                let q = &self.queries[&query_id];
                (q.query.clone(), q.outcome.verdict, q.outcome.touches.clone())
            };
            let new_outcome = self.evaluate(query.ir_id, &query.doc_entry_point, &query.path);
            let verdict_changed = new_outcome.verdict != old_verdict;
            let touches_changed = new_outcome.touches != old_touches;
            let doc_in_new_touches = new_outcome.touches.iter().any(|(d, _)| *d == delta.doc);

            let subscribers = self.queries[&query_id].subscribers.clone();
            if verdict_changed || touches_changed || doc_in_new_touches {
                debug!(query_id, verdict_changed, touches_changed, "query result changed");
                self.deliver_to_subscribers(&subscribers, &delta.doc, &delta.at_version);
                events.push(EngineEvent {
                    query_id: query_id.clone(),
                    verdict_changed,
                    touches_changed,
                });
            }
            self.queries.get_mut(&query_id).expect("exists").outcome = new_outcome;
        }
        events
    }

    fn deliver_to_subscribers(&mut self, subscribers: &BTreeSet<String>, doc: &Entity, version: &Version) {
        let Some(value) = self.resolver.get(doc) else {
            return;
        };
        for client_id in subscribers {
            let should_send = self
                .clients
                .get(client_id)
                .map(|c| c.sent_version_by_doc.get(doc).copied().unwrap_or(0) < version.epoch)
                .unwrap_or(true);
            if !should_send {
                continue;
            }
            let id = self.alloc_delivery_id();
            let client = self.clients.entry(client_id.clone()).or_default();
            client.sent_version_by_doc.insert(doc.clone(), version.epoch);
            client.outbox.push(OutboundMessage::DocUpdate(DocUpdate {
                id,
                doc_id: doc.clone(),
                version: version.clone(),
                doc: value.clone(),
            }));
        }
    }

    /// The verdict currently recorded for a registered query, if any.
    pub fn verdict_of(&self, query_id: &str) -> Option<Verdict> {
        self.queries.get(query_id).and_then(|q| q.outcome.verdict)
    }

    /// Pending (unacked) outbound messages for a client, in order.
    pub fn pending_for(&self, client_id: &str) -> Vec<OutboundMessage> {
        self.clients
            .get(client_id)
            .map(|c| c.outbox.pending().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_path::Token;

    struct MapResolver(Mutex<HashMap<Entity, serde_json::Value>>);

    impl DocResolver for MapResolver {
        fn get(&self, doc: &Entity) -> Option<serde_json::Value> {
            self.0.lock().unwrap().get(doc).cloned()
        }
    }

    impl MapResolver {
        fn set(&self, doc: &Entity, value: serde_json::Value) {
            self.0.lock().unwrap().insert(doc.clone(), value);
        }
    }

    fn v(epoch: u64) -> Version {
        Version { epoch, branch: "main".into() }
    }

    #[test]
    fn unrelated_write_produces_no_event() {
        let mut ir = SchemaIr::new();
        let ir_id = ir
            .compile(&serde_json::json!({
                "type": "object",
                "properties": {"email": {"type": "string"}}
            }))
            .unwrap();
        let doc = Entity::new("of:user0");
        let resolver = Arc::new(MapResolver(Mutex::new(
            [(doc.clone(), serde_json::json!({"email": "a@example.com", "unrelated": 1}))].into(),
        )));
        let mut engine = SubscribeEngine::new(Arc::new(Mutex::new(ir)), resolver.clone());
        let query = Query {
            query_id: "q1".into(),
            doc_entry_point: doc.clone(),
            path: PathBuf::root(),
            ir_id,
        };
        engine.subscribe("client-a", query, v(1));

        resolver.set(&doc, serde_json::json!({"email": "a@example.com", "unrelated": 2}));
        let events = engine.apply_delta(&Delta {
            doc: doc.clone(),
            changed_paths: vec![PathBuf::root().child(Token::field("unrelated"))],
            removed_paths: vec![],
            at_version: v(2),
        });
        assert!(events.is_empty());
    }

    #[test]
    fn relevant_write_emits_doc_update() {
        let mut ir = SchemaIr::new();
        let ir_id = ir
            .compile(&serde_json::json!({
                "type": "object",
                "properties": {"email": {"type": "string"}}
            }))
            .unwrap();
        let doc = Entity::new("of:user0");
        let resolver = Arc::new(MapResolver(Mutex::new(
            [(doc.clone(), serde_json::json!({"email": "a@example.com"}))].into(),
        )));
        let mut engine = SubscribeEngine::new(Arc::new(Mutex::new(ir)), resolver.clone());
        let query = Query {
            query_id: "q1".into(),
            doc_entry_point: doc.clone(),
            path: PathBuf::root(),
            ir_id,
        };
        engine.subscribe("client-a", query, v(1));
        engine.ack(
            "client-a",
            engine.pending_for("client-a").first().unwrap().delivery_id(),
        );

        resolver.set(&doc, serde_json::json!({"email": "b@example.com"}));
        let events = engine.apply_delta(&Delta {
            doc: doc.clone(),
            changed_paths: vec![PathBuf::root().child(Token::field("email"))],
            removed_paths: vec![],
            at_version: v(2),
        });
        assert_eq!(events.len(), 1);
        let pending = engine.pending_for("client-a");
        assert_eq!(pending.len(), 1);
    }
}
