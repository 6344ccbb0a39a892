//! Single-use cache of source-shard states.

use std::collections::HashMap;

use super::state::NodeModelState;

/// Source states keyed by `(sharding_rank, source_pp_rank)`; each entry can be taken once.
#[derive(Debug, Default)]
pub struct StateCache {
    entries: HashMap<(usize, usize), NodeModelState>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sharding_rank: usize, pp_rank: usize, state: NodeModelState) {
        if self.entries.insert((sharding_rank, pp_rank), state).is_some() {
            tracing::warn!(
                "State for sharding rank {} / pp rank {} replaced in cache",
                sharding_rank,
                pp_rank
            );
        }
    }

    pub fn contains(&self, sharding_rank: usize, pp_rank: usize) -> bool {
        self.entries.contains_key(&(sharding_rank, pp_rank))
    }

    /// Remove and return a cached state; a missing or already taken key is an error.
    pub fn take(&mut self, sharding_rank: usize, pp_rank: usize) -> crate::Result<NodeModelState> {
        self.entries.remove(&(sharding_rank, pp_rank)).ok_or_else(|| {
            crate::ReshardError::Sequencing(format!(
                "no cached state for sharding rank {} / pp rank {} (never loaded or already consumed)",
                sharding_rank, pp_rank
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
