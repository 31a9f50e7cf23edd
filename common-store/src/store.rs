//! The fact store: CAS-backed facts plus the secondary
//! `(space, entity, attribute, seq) -> digest` index (spec.md §4.2).

use crate::cas::{CasStore, SledCas};
use crate::error::Result;
use crate::fact::{Attribute, Fact};
use crate::Digest;
use common_path::{Entity, Space};
use std::convert::TryInto;

const FACT_KIND: &str = "fact";

/// Content-addressed fact storage for one or more spaces, with a secondary
/// index for "latest fact of (space, entity, attribute)" and full lineage
/// walks.
pub struct FactStore {
    cas: SledCas,
    index: sled::Tree,
}

impl FactStore {
    /// Wraps an open `sled::Db`.
    pub fn new(db: sled::Db) -> Result<Self> {
        let index = db.open_tree("fact-index")?;
        Ok(Self {
            cas: SledCas::new(db),
            index,
        })
    }

    /// An in-memory store for tests.
    pub fn memory() -> Result<Self> {
        Self::new(sled::Config::new().temporary(true).open()?)
    }

    fn index_key(space: &Space, of: &Entity, the: &Attribute, seq: u64) -> Vec<u8> {
        let mut key = Vec::new();
        key.extend(space.as_str().as_bytes());
        key.push(0);
        key.extend(of.as_str().as_bytes());
        key.push(0);
        key.extend(the.as_bytes());
        key.push(0);
        key.extend(seq.to_be_bytes());
        key
    }

    fn prefix_key(space: &Space, of: &Entity, the: &Attribute) -> Vec<u8> {
        let mut key = Vec::new();
        key.extend(space.as_str().as_bytes());
        key.push(0);
        key.extend(of.as_str().as_bytes());
        key.push(0);
        key.extend(the.as_bytes());
        key.push(0);
        key
    }

    /// Asserts a new fact for `(space, entity, attribute)`, chaining it
    /// onto the current lineage tip as `cause`. Returns the fact's digest
    /// and its sequence number within the lineage.
    pub fn assert(
        &self,
        space: &Space,
        of: &Entity,
        the: &Attribute,
        is: serde_json::Value,
    ) -> Result<(Digest, u64)> {
        let (cause, seq) = match self.latest(space, of, the)? {
            Some((digest, seq)) => (Some(digest), seq + 1),
            None => (None, 0),
        };
        let fact = Fact::new(the.clone(), of.clone(), is, cause);
        let bytes = fact.canonical_bytes();
        let digest = match self.cas.put(FACT_KIND, &bytes) {
            Ok(d) => d,
            Err(crate::error::StoreError::AlreadyExistsBenign(d)) => d,
            Err(e) => return Err(e),
        };
        self.index
            .insert(Self::index_key(space, of, the, seq), digest.as_bytes())?;
        self.index.flush()?;
        Ok((digest, seq))
    }

    /// Returns the digest and sequence number of the current lineage tip.
    pub fn latest(
        &self,
        space: &Space,
        of: &Entity,
        the: &Attribute,
    ) -> Result<Option<(Digest, u64)>> {
        let prefix = Self::prefix_key(space, of, the);
        match self.index.scan_prefix(&prefix).last() {
            Some(entry) => {
                let (k, v) = entry?;
                let seq_bytes: [u8; 8] = k[k.len() - 8..].try_into().expect("8-byte seq suffix");
                let seq = u64::from_be_bytes(seq_bytes);
                let digest = Digest::from_bytes(v.as_ref().try_into().expect("32-byte digest"));
                Ok(Some((digest, seq)))
            }
            None => Ok(None),
        }
    }

    /// Reads back the fact at a digest.
    pub fn get(&self, digest: Digest) -> Result<Option<Fact>> {
        let Some(bytes) = self.cas.get_kind(FACT_KIND, digest)? else {
            return Ok(None);
        };
        Ok(Some(
            serde_json::from_slice(&bytes).expect("stored fact bytes are valid JSON"),
        ))
    }

    /// Returns the current value for `(space, entity, attribute)`, if any.
    pub fn value(&self, space: &Space, of: &Entity, the: &Attribute) -> Result<Option<serde_json::Value>> {
        match self.latest(space, of, the)? {
            Some((digest, _)) => Ok(self.get(digest)?.map(|f| f.is)),
            None => Ok(None),
        }
    }

    /// Walks the full causal lineage for `(space, entity, attribute)` from
    /// newest to oldest.
    pub fn lineage(&self, space: &Space, of: &Entity, the: &Attribute) -> Result<Vec<Fact>> {
        let mut out = Vec::new();
        let mut next = self.latest(space, of, the)?.map(|(d, _)| d);
        while let Some(digest) = next {
            let Some(fact) = self.get(digest)? else { break };
            next = fact.cause;
            out.push(fact);
        }
        Ok(out)
    }

    /// Access to the raw CAS, for callers (e.g. common-branch) that store
    /// their own blob kinds (change bytes, snapshots) alongside facts.
    pub fn cas(&self) -> &SledCas {
        &self.cas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (FactStore, Space, Entity, Attribute) {
        (
            FactStore::memory().unwrap(),
            Space::new("did:key:zSpace"),
            Entity::new("of:doc1"),
            crate::fact::ATTR_JSON.to_string(),
        )
    }

    #[test]
    fn assert_then_value_round_trips() {
        let (store, space, of, the) = setup();
        store.assert(&space, &of, &the, serde_json::json!({"v": 1})).unwrap();
        assert_eq!(
            store.value(&space, &of, &the).unwrap(),
            Some(serde_json::json!({"v": 1}))
        );
    }

    #[test]
    fn lineage_chains_by_cause() {
        let (store, space, of, the) = setup();
        store.assert(&space, &of, &the, serde_json::json!(1)).unwrap();
        store.assert(&space, &of, &the, serde_json::json!(2)).unwrap();
        store.assert(&space, &of, &the, serde_json::json!(3)).unwrap();
        let lineage = store.lineage(&space, &of, &the).unwrap();
        let values: Vec<_> = lineage.iter().map(|f| f.is.clone()).collect();
        assert_eq!(values, vec![serde_json::json!(3), serde_json::json!(2), serde_json::json!(1)]);
    }

    #[test]
    fn independent_entities_do_not_interfere() {
        let store = FactStore::memory().unwrap();
        let space = Space::new("did:key:zSpace");
        let a = Entity::new("of:a");
        let b = Entity::new("of:b");
        let the = crate::fact::ATTR_JSON.to_string();
        store.assert(&space, &a, &the, serde_json::json!("a")).unwrap();
        store.assert(&space, &b, &the, serde_json::json!("b")).unwrap();
        assert_eq!(store.value(&space, &a, &the).unwrap(), Some(serde_json::json!("a")));
        assert_eq!(store.value(&space, &b, &the).unwrap(), Some(serde_json::json!("b")));
    }

    #[test]
    fn reasserting_identical_value_still_advances_lineage() {
        let (store, space, of, the) = setup();
        let (d1, seq1) = store.assert(&space, &of, &the, serde_json::json!(1)).unwrap();
        let (d2, seq2) = store.assert(&space, &of, &the, serde_json::json!(1)).unwrap();
        // same `is` but different `cause` (seq advanced) => different digest.
        assert_ne!(d1, d2);
        assert_eq!(seq2, seq1 + 1);
    }
}
