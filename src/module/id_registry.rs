//! Per-round module id bookkeeping.

use std::collections::BTreeSet;

use crate::error::{CrateError, CrateResult};

/// Ids seen during one init round.
///
/// Cleared after every init phase, so each phase checks uniqueness on its own.
#[derive(Debug, Default)]
pub struct IdRegistry {
    seen: BTreeSet<u32>,
}

impl IdRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id`, failing if it was already recorded this round.
    pub fn mark(&mut self, id: u32) -> CrateResult<()> {
        if self.seen.insert(id) {
            Ok(())
        } else {
            Err(CrateError::DuplicateModuleId { id })
        }
    }

    /// Forget all ids.
    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
