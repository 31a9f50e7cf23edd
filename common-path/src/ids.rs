//! Stable identifiers for spaces and entities.

use serde::{Deserialize, Serialize};

/// A principal-owned replication scope, identified by a DID string.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Space(String);

impl Space {
    /// Wraps a DID string as a space identifier.
    pub fn new(did: impl Into<String>) -> Self {
        Self(did.into())
    }

    /// Returns the DID string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Space {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A stable identifier within a [`Space`]. Entities are opaque strings;
/// the runtime most commonly mints them as `of:<blake3 hex>` content
/// addresses (see `common-cell`'s id-based entity reuse) but any stable
/// string is a valid entity id.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity(String);

impl Entity {
    /// Wraps an opaque identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives a content-addressed entity id from arbitrary seed bytes
    /// (e.g. a canonicalized JSON value, or a frame's cause + nonce).
    pub fn derive(seed: &[u8]) -> Self {
        Self(format!("of:{}", blake3::hash(seed).to_hex()))
    }

    /// Returns the identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Entity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        assert_eq!(Entity::derive(b"seed"), Entity::derive(b"seed"));
        assert_ne!(Entity::derive(b"seed-a"), Entity::derive(b"seed-b"));
    }
}
