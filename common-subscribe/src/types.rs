//! Wire types for the subscription/delivery engine (spec.md §4.6, §6).

use common_path::{Entity, PathBuf};
use common_schema::IrId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A registered query: what to watch and how to interpret it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Query {
    pub query_id: String,
    pub doc_entry_point: Entity,
    pub path: PathBuf,
    pub ir_id: IrId,
}

/// A point-in-time coordinate carried on delivered documents
/// (spec.md §6 `DOC_UPDATE {version: {epoch, branch}}`).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub epoch: u64,
    pub branch: String,
}

/// A change notification emitted after a transaction commits
/// (spec.md §4.6).
#[derive(Clone, Debug)]
pub struct Delta {
    pub doc: Entity,
    pub changed_paths: Vec<PathBuf>,
    pub removed_paths: Vec<PathBuf>,
    pub at_version: Version,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocUpdate {
    pub id: u64,
    pub doc_id: Entity,
    pub version: Version,
    pub doc: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuerySynced {
    pub id: u64,
    pub query_id: String,
    pub watermark: u64,
}

/// A message sent from the engine to a client (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OutboundMessage {
    DocUpdate(DocUpdate),
    QuerySynced(QuerySynced),
}

impl OutboundMessage {
    pub fn delivery_id(&self) -> u64 {
        match self {
            OutboundMessage::DocUpdate(d) => d.id,
            OutboundMessage::QuerySynced(q) => q.id,
        }
    }
}
