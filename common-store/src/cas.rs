//! Content-addressed storage: `put`/`get`/`has` over a digest-keyed blob
//! table (spec.md §4.2).

use crate::error::{Result, StoreError};
use crate::Digest;

/// A content-addressed blob store. Implementations must be safe for
/// concurrent readers while a single writer puts new blobs (spec.md §5).
pub trait CasStore: Send + Sync {
    /// Stores `bytes` under a `kind`-namespaced digest and returns it.
    /// Re-putting identical bytes is idempotent: it returns
    /// `Err(StoreError::AlreadyExistsBenign(digest))` rather than failing
    /// the caller's transaction, so callers should treat that variant as
    /// success plus a flag, not a hard error.
    fn put(&self, kind: &str, bytes: &[u8]) -> Result<Digest>;

    /// Fetches a previously stored blob by digest.
    fn get(&self, digest: Digest) -> Result<Option<Vec<u8>>>;

    /// True if the digest is present.
    fn has(&self, digest: Digest) -> Result<bool>;
}

/// A `sled`-backed [`CasStore`], one tree per `kind` namespace (facts,
/// change blobs, snapshots), using the same `sled::Db::open_tree`-per-
/// namespace split as the rest of this workspace's `sled` backends.
pub struct SledCas {
    db: sled::Db,
}

impl SledCas {
    /// Wraps an open `sled::Db`.
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    /// Opens an in-memory, ephemeral CAS for tests.
    pub fn memory() -> Result<Self> {
        Ok(Self::new(sled::Config::new().temporary(true).open()?))
    }

    fn tree(&self, kind: &str) -> Result<sled::Tree> {
        Ok(self.db.open_tree(format!("cas:{kind}"))?)
    }
}

impl CasStore for SledCas {
    fn put(&self, kind: &str, bytes: &[u8]) -> Result<Digest> {
        let tree = self.tree(kind)?;
        let digest = Digest::of(bytes);
        let key = digest.as_bytes();
        if tree.contains_key(key)? {
            return Err(StoreError::AlreadyExistsBenign(digest));
        }
        tree.insert(key, bytes)?;
        tree.flush()?;
        Ok(digest)
    }

    fn get(&self, digest: Digest) -> Result<Option<Vec<u8>>> {
        // A blob's namespace is unknown to the caller in general, so CAS
        // reads scan every kind tree that has been opened so far. Callers
        // that know the kind should prefer `SledCas::get_kind`.
        for name in self.db.tree_names() {
            let tree = self.db.open_tree(&name)?;
            if let Some(v) = tree.get(digest.as_bytes())? {
                return Ok(Some(v.to_vec()));
            }
        }
        Ok(None)
    }

    fn has(&self, digest: Digest) -> Result<bool> {
        Ok(self.get(digest)?.is_some())
    }
}

impl SledCas {
    /// Fetches a blob known to live under a specific `kind` namespace,
    /// avoiding the all-tree scan `get` falls back to.
    pub fn get_kind(&self, kind: &str, digest: Digest) -> Result<Option<Vec<u8>>> {
        let tree = self.tree(kind)?;
        Ok(tree.get(digest.as_bytes())?.map(|v| v.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let cas = SledCas::memory().unwrap();
        let digest = cas.put("fact", b"hello").unwrap();
        assert_eq!(cas.get(digest).unwrap().unwrap(), b"hello");
        assert!(cas.has(digest).unwrap());
    }

    #[test]
    fn repeated_put_is_benign() {
        let cas = SledCas::memory().unwrap();
        let first = cas.put("fact", b"hello").unwrap();
        let err = cas.put("fact", b"hello").unwrap_err();
        match err {
            StoreError::AlreadyExistsBenign(d) => assert_eq!(d, first),
            other => panic!("expected AlreadyExistsBenign, got {other:?}"),
        }
    }

    #[test]
    fn missing_digest_is_none() {
        let cas = SledCas::memory().unwrap();
        assert!(cas.get(Digest::of(b"nope")).unwrap().is_none());
        assert!(!cas.has(Digest::of(b"nope")).unwrap());
    }
}
