//! The subscription/delivery layer: queries over compiled schemas,
//! dirty invalidation on commit, and bounded per-client delivery
//! (spec.md §4.6).

mod engine;
mod outbox;
mod types;

pub use engine::{EngineEvent, SubscribeEngine};
pub use outbox::{Outbox, DEFAULT_OUTBOX_CAPACITY};
pub use types::{Delta, DocUpdate, OutboundMessage, Query, QuerySynced, Version};
