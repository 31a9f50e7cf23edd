//! Client-side storage provider (spec.md §4.10): a session over a
//! remote memory space with local-ahead write tracking and reconnect.

mod error;
mod fact;
mod provider;
mod reconnect;
mod transport;

pub use error::{ClientError, Result};
pub use fact::Fact;
pub use provider::{StorageProvider, DEFAULT_MAX_REMOTE_SUBSCRIPTIONS};
pub use reconnect::ReconnectPolicy;
pub use transport::{ClientMessage, Transport};
