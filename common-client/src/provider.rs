//! Per-space storage provider session (spec.md §4.10).

use crate::error::{ClientError, Result};
use crate::fact::Fact;
use crate::reconnect::ReconnectPolicy;
use crate::transport::{ClientMessage, Transport};
use common_branch::apply_ops;
use common_path::{Entity, PathBuf};
use common_subscribe::OutboundMessage;
use common_tx::TxRequest;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

pub const DEFAULT_MAX_REMOTE_SUBSCRIPTIONS: usize = 10_000;

struct RemoteSubscription {
    query_id: String,
    path: PathBuf,
    schema: Option<Value>,
}

type SinkCallback = Box<dyn FnMut(&Value) + Send>;

/// Per-space session over a remote memory space: subscribe by entity,
/// push assertions, reconcile local-ahead state against server acks
/// (spec.md §4.10).
pub struct StorageProvider<T: Transport> {
    transport: T,
    reconnect: ReconnectPolicy,
    max_remote: usize,
    reconnect_attempts: AtomicU32,

    remote: Mutex<HashMap<Entity, RemoteSubscription>>,
    remote_docs: Mutex<HashMap<Entity, Value>>,
    local: Mutex<HashMap<Entity, Fact>>,
    sinks: Mutex<HashMap<Entity, Vec<SinkCallback>>>,
    pending: Mutex<VecDeque<ClientMessage>>,
}

impl<T: Transport> StorageProvider<T> {
    pub fn new(transport: T) -> Self {
        Self::with_limits(transport, DEFAULT_MAX_REMOTE_SUBSCRIPTIONS, ReconnectPolicy::default())
    }

    pub fn with_limits(transport: T, max_remote: usize, reconnect: ReconnectPolicy) -> Self {
        Self {
            transport,
            reconnect,
            max_remote,
            reconnect_attempts: AtomicU32::new(0),
            remote: Mutex::new(HashMap::new()),
            remote_docs: Mutex::new(HashMap::new()),
            local: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    fn dispatch(&self, message: ClientMessage) -> Result<()> {
        if self.transport.is_connected() {
            if let Err(reason) = self.transport.send(&message) {
                self.pending.lock().expect("pending lock").push_back(message);
                return Err(ClientError::TransportSend(reason));
            }
            Ok(())
        } else {
            self.pending.lock().expect("pending lock").push_back(message);
            Ok(())
        }
    }

    /// Subscribes to `entity`, optionally narrowed by `schema`
    /// (spec.md `sync`).
    pub fn sync(&self, entity: Entity, schema: Option<Value>) -> Result<()> {
        let mut remote = self.remote.lock().expect("remote lock");
        if !remote.contains_key(&entity) && remote.len() >= self.max_remote {
            return Err(ClientError::SubscriptionLimitReached { active: remote.len(), max: self.max_remote });
        }
        let query_id = format!("q:{entity}");
        remote.insert(
            entity.clone(),
            RemoteSubscription { query_id: query_id.clone(), path: PathBuf::root(), schema: schema.clone() },
        );
        drop(remote);
        self.dispatch(ClientMessage::Subscribe { query_id, doc_entry: entity, path: PathBuf::root(), schema })
    }

    pub fn unsubscribe(&self, entity: &Entity) -> Result<()> {
        let Some(sub) = self.remote.lock().expect("remote lock").remove(entity) else {
            return Ok(());
        };
        self.dispatch(ClientMessage::Unsubscribe { query_id: sub.query_id })
    }

    /// Registers `callback` to be invoked whenever `entity`'s
    /// materialized value changes (spec.md `sink`).
    pub fn sink(&self, entity: Entity, callback: impl FnMut(&Value) + Send + 'static) {
        self.sinks.lock().expect("sinks lock").entry(entity).or_default().push(Box::new(callback));
    }

    /// Local-ahead overlay over the last-acknowledged remote value
    /// (spec.md `get`).
    pub fn get(&self, entity: &Entity) -> Option<Value> {
        if let Some(fact) = self.local.lock().expect("local lock").get(entity) {
            return Some(fact.is.clone());
        }
        self.remote_docs.lock().expect("remote docs lock").get(entity).cloned()
    }

    /// Submits a batch of changes, provisionally recording each touched
    /// document as locally-ahead until the server acknowledges or
    /// rejects it (spec.md `send`). The optimistic value is the current
    /// overlay value (local-ahead if one exists, else the last
    /// acknowledged remote value) with `write.changes`'s ops folded on
    /// top, exactly as the server will apply them once committed.
    pub fn send(&self, changes: TxRequest) -> Result<()> {
        let mut local = self.local.lock().expect("local lock");
        for write in &changes.writes {
            let mut optimistic = local
                .get(&write.doc_id)
                .map(|fact| fact.is.clone())
                .or_else(|| self.remote_docs.lock().expect("remote docs lock").get(&write.doc_id).cloned())
                .unwrap_or(Value::Null);
            for change in &write.changes {
                apply_ops(&mut optimistic, &change.ops);
            }
            local.insert(
                write.doc_id.clone(),
                Fact { the: "application/json".into(), of: write.doc_id.clone(), is: optimistic, cause: None },
            );
        }
        drop(local);
        self.dispatch(ClientMessage::Submit(changes))
    }

    /// Feeds one inbound server message through reconciliation, acking
    /// deliveries and clearing local-ahead facts that now match the
    /// acknowledged remote value (spec.md §4.10).
    pub fn on_message(&self, message: OutboundMessage) -> Result<()> {
        match message {
            OutboundMessage::DocUpdate(update) => {
                self.remote_docs.lock().expect("remote docs lock").insert(update.doc_id.clone(), update.doc.clone());
                self.reconcile(&update.doc_id, &update.doc);
                self.notify_sinks(&update.doc_id, &update.doc);
                self.dispatch(ClientMessage::Ack { id: update.id })
            }
            OutboundMessage::QuerySynced(_) => Ok(()),
        }
    }

    fn reconcile(&self, entity: &Entity, remote_value: &Value) {
        let mut local = self.local.lock().expect("local lock");
        if let Some(fact) = local.get(entity) {
            if &fact.is == remote_value {
                local.remove(entity);
            }
        }
    }

    /// Discards a locally-ahead fact after the server rejects its
    /// transaction, along with any dependent facts (tracked externally
    /// by the caller, since dependency chains live in the change graph
    /// this crate does not itself materialize).
    pub fn discard_failed(&self, entities: &[Entity]) {
        let mut local = self.local.lock().expect("local lock");
        for entity in entities {
            local.remove(entity);
        }
    }

    fn notify_sinks(&self, entity: &Entity, value: &Value) {
        if let Some(callbacks) = self.sinks.lock().expect("sinks lock").get_mut(entity) {
            for cb in callbacks.iter_mut() {
                cb(value);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Delay before the next reconnect attempt, per the configured
    /// backoff policy.
    pub fn next_reconnect_delay(&self) -> std::time::Duration {
        self.reconnect.delay_for(self.reconnect_attempts.load(Ordering::SeqCst))
    }

    pub fn note_disconnect(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
    }

    /// Re-issues every active subscription and drains queued unsent
    /// commands (spec.md §4.10 "on reopen, re-issue every subscription
    /// and drain queued unsent commands").
    pub fn on_reconnect(&self) -> Result<()> {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        let subs: Vec<ClientMessage> = self
            .remote
            .lock()
            .expect("remote lock")
            .iter()
            .map(|(entity, sub)| ClientMessage::Subscribe {
                query_id: sub.query_id.clone(),
                doc_entry: entity.clone(),
                path: sub.path.clone(),
                schema: sub.schema.clone(),
            })
            .collect();
        for message in subs {
            self.dispatch(message)?;
        }
        let queued: Vec<ClientMessage> = self.pending.lock().expect("pending lock").drain(..).collect();
        for message in queued {
            self.dispatch(message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_subscribe::{DocUpdate, Version};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeTransport {
        connected: AtomicBool,
        sent: Mutex<Vec<ClientMessage>>,
        fail_next: AtomicUsize,
    }

    impl Transport for Arc<FakeTransport> {
        fn send(&self, message: &ClientMessage) -> std::result::Result<(), String> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err("boom".into());
            }
            self.sent.lock().expect("sent lock").push(message.clone());
            Ok(())
        }
        fn try_recv(&self) -> Option<OutboundMessage> {
            None
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn connected_transport() -> Arc<FakeTransport> {
        let t = Arc::new(FakeTransport::default());
        t.connected.store(true, Ordering::SeqCst);
        t
    }

    #[test]
    fn sync_sends_subscribe_when_connected() {
        let transport = connected_transport();
        let provider = StorageProvider::new(transport.clone());
        provider.sync(Entity::new("of:doc1"), None).unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn sync_queues_when_disconnected() {
        let transport = Arc::new(FakeTransport::default());
        let provider = StorageProvider::new(transport.clone());
        provider.sync(Entity::new("of:doc1"), None).unwrap();
        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(provider.pending.lock().unwrap().len(), 1);
    }

    #[test]
    fn send_marks_entity_locally_ahead_with_the_optimistic_value_until_acked() {
        let transport = connected_transport();
        let provider = StorageProvider::new(transport);
        let doc = Entity::new("of:doc1");
        let change = common_branch::Change::new(
            "actor-a",
            1,
            vec![],
            vec![common_branch::WriteOp::Set {
                path: common_path::PathBuf::root().child(common_path::Token::field("name")),
                value: serde_json::json!("ada"),
            }],
        );
        let req = TxRequest {
            space_id: common_path::Space::new("did:test"),
            tx_id: None,
            reads: vec![],
            writes: vec![common_tx::WriteEntry {
                doc_id: doc.clone(),
                branch: "main".into(),
                base_heads: Default::default(),
                changes: vec![change],
                allow_server_merge: false,
            }],
        };
        provider.send(req).unwrap();
        assert_eq!(provider.get(&doc), Some(serde_json::json!({"name": "ada"})));
    }

    #[test]
    fn send_folds_changes_onto_the_last_acknowledged_remote_value() {
        let transport = connected_transport();
        let provider = StorageProvider::new(transport);
        let doc = Entity::new("of:doc1");
        provider
            .remote_docs
            .lock()
            .unwrap()
            .insert(doc.clone(), serde_json::json!({"name": "ada", "age": 30}));
        let change = common_branch::Change::new(
            "actor-a",
            1,
            vec![],
            vec![common_branch::WriteOp::Set {
                path: common_path::PathBuf::root().child(common_path::Token::field("age")),
                value: serde_json::json!(31),
            }],
        );
        let req = TxRequest {
            space_id: common_path::Space::new("did:test"),
            tx_id: None,
            reads: vec![],
            writes: vec![common_tx::WriteEntry {
                doc_id: doc.clone(),
                branch: "main".into(),
                base_heads: Default::default(),
                changes: vec![change],
                allow_server_merge: false,
            }],
        };
        provider.send(req).unwrap();
        assert_eq!(provider.get(&doc), Some(serde_json::json!({"name": "ada", "age": 31})));
    }

    #[test]
    fn matching_ack_clears_local_ahead_fact() {
        let transport = connected_transport();
        let provider = StorageProvider::new(transport);
        let doc = Entity::new("of:doc1");
        provider.local.lock().unwrap().insert(
            doc.clone(),
            Fact { the: "application/json".into(), of: doc.clone(), is: serde_json::json!({"a": 1}), cause: None },
        );
        provider
            .on_message(OutboundMessage::DocUpdate(DocUpdate {
                id: 1,
                doc_id: doc.clone(),
                version: Version { epoch: 1, branch: "main".into() },
                doc: serde_json::json!({"a": 1}),
            }))
            .unwrap();
        assert!(provider.local.lock().unwrap().get(&doc).is_none());
    }

    #[test]
    fn reconnect_reissues_subscriptions_and_drains_pending() {
        let transport = Arc::new(FakeTransport::default());
        let provider = StorageProvider::new(transport.clone());
        provider.sync(Entity::new("of:doc1"), None).unwrap();
        provider.send(TxRequest {
            space_id: common_path::Space::new("did:test"),
            tx_id: None,
            reads: vec![],
            writes: vec![],
        }).unwrap();
        transport.connected.store(true, Ordering::SeqCst);
        provider.on_reconnect().unwrap();
        // one re-issued subscribe + the originally queued subscribe-and-submit drained
        assert_eq!(transport.sent.lock().unwrap().len(), 3);
    }
}
