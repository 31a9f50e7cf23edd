//! The invariant extension point (spec.md §4.4 step 5, §9 open question):
//! "leave a clean extension point but not invent policies" — so the
//! default registry here is empty.

use crate::types::WriteResult;
use common_path::Space;

/// A post-commit check run over a transaction's accepted write results.
/// Implementors decide what "wrong" means for their deployment; the core
/// ships none.
pub trait TxInvariant: Send + Sync {
    /// A stable name used in [`crate::TxError::InvariantFailure`].
    fn name(&self) -> &str;

    /// Returns `Err(reason)` if `results` violates the invariant.
    fn check(&self, space: &Space, results: &[WriteResult]) -> Result<(), String>;
}

/// An ordered collection of [`TxInvariant`]s run after every commit.
#[derive(Default)]
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn TxInvariant>>,
}

impl InvariantRegistry {
    /// An empty registry (the default for `common-tx`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an invariant, run in registration order.
    pub fn register(&mut self, invariant: Box<dyn TxInvariant>) {
        self.invariants.push(invariant);
    }

    pub(crate) fn check_all(&self, space: &Space, results: &[WriteResult]) -> Result<(), (String, String)> {
        for invariant in &self.invariants {
            if let Err(reason) = invariant.check(space, results) {
                return Err((invariant.name().to_string(), reason));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_never_fails() {
        let registry = InvariantRegistry::new();
        let space = Space::new("did:key:z1");
        assert!(registry.check_all(&space, &[]).is_ok());
    }
}
