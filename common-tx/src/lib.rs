//! The transaction processor (spec.md §4.4): atomic, single-writer-per-space
//! submission combining read-set validation with per-document conflict
//! detection delegated to `common-branch`.

mod error;
mod invariant;
mod processor;
mod resolver;
mod types;

pub use error::{Result, TxError};
pub use invariant::{InvariantRegistry, TxInvariant};
pub use processor::TxProcessor;
pub use types::{
    Digests, ReadAssertion, TxReceipt, TxRequest, WriteEntry, WriteResult, WriteStatus,
};

// Re-exported so callers can build `subscribe`/`ack` calls against
// `TxProcessor` without a direct `common-subscribe` dependency, and compile
// query schemas into `TxProcessor::schema_ir()`.
pub use common_schema::SchemaIr;
pub use common_subscribe::{Delta, EngineEvent, OutboundMessage, Query, QuerySynced, Version};
