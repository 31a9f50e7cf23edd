//! Locally-ahead facts: writes the client has submitted but not yet
//! seen acknowledged by the server (spec.md §3, §4.10).

use common_path::Entity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An immutable assertion `{the, of, is, cause}` (spec.md §3).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub the: String,
    pub of: Entity,
    pub is: Value,
    pub cause: Option<String>,
}
