//! The transport the storage provider drives is opaque (spec.md §4.10
//! "transport-opaque"); this crate only needs it to be able to send
//! client messages and hand back inbound server messages as they
//! arrive.

use common_subscribe::OutboundMessage;
use common_tx::TxRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message the client can send to the server (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClientMessage {
    Subscribe { query_id: String, doc_entry: common_path::Entity, path: common_path::PathBuf, schema: Option<Value> },
    Unsubscribe { query_id: String },
    Ack { id: u64 },
    Submit(TxRequest),
}

/// Minimal transport contract. Implementations own the actual socket;
/// `send` never blocks on a network round-trip and `try_recv` is a
/// non-blocking poll so the provider can stay on the caller's thread.
pub trait Transport: Send {
    fn send(&self, message: &ClientMessage) -> std::result::Result<(), String>;
    fn try_recv(&self) -> Option<OutboundMessage>;
    fn is_connected(&self) -> bool;
}
