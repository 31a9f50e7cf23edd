//! A [`DocResolver`] reading materialized document JSON straight from a
//! shared [`BranchEngine`], backing the per-space subscription engine
//! (spec.md §4.6). Mirrors `common_cell::BranchResolver`; duplicated here
//! rather than depended on, since `common-cell` already depends on
//! `common-tx` and a reverse edge would be a dependency cycle.

use common_branch::BranchEngine;
use common_path::{Entity, Space};
use common_schema::DocResolver;
use serde_json::Value;
use std::sync::Arc;

pub struct TxDocResolver {
    branches: Arc<BranchEngine>,
    space: Space,
    branch: String,
}

impl TxDocResolver {
    pub fn new(branches: Arc<BranchEngine>, space: Space, branch: impl Into<String>) -> Self {
        Self {
            branches,
            space,
            branch: branch.into(),
        }
    }
}

impl DocResolver for TxDocResolver {
    fn get(&self, doc: &Entity) -> Option<Value> {
        self.branches.cached_json(&self.space, doc, &self.branch).ok().flatten()
    }
}
