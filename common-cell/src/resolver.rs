//! A [`DocResolver`] that reads documents from a [`BranchEngine`]'s cached
//! head JSON, so the schema evaluator (common-schema) can follow links
//! across entities without knowing anything about branches or sleds.

use common_branch::BranchEngine;
use common_path::{Entity, Space};
use common_schema::DocResolver;
use serde_json::Value;
use std::sync::Arc;

pub struct BranchResolver {
    branches: Arc<BranchEngine>,
    space: Space,
    branch: String,
}

impl BranchResolver {
    pub fn new(branches: Arc<BranchEngine>, space: Space, branch: impl Into<String>) -> Self {
        Self {
            branches,
            space,
            branch: branch.into(),
        }
    }
}

impl DocResolver for BranchResolver {
    fn get(&self, doc: &Entity) -> Option<Value> {
        self.branches
            .cached_json(&self.space, doc, &self.branch)
            .ok()
            .flatten()
    }
}
