//! In-flight turn registry.
//!
//! At most one turn per (subject, counterpart) pair may be past context
//! assembly and short of a terminal state. The marker is released when the
//! guard drops, which covers completion, failure, abort and task
//! cancellation alike.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_traits::PartitionKey;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    turns: Arc<DashMap<PartitionKey, String>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the pair for `turn_id`, or `None` if another turn holds it.
    pub fn try_acquire(&self, partition: PartitionKey, turn_id: &str) -> Option<TurnGuard> {
        match self.turns.entry(partition.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(turn_id.to_string());
                Some(TurnGuard {
                    turns: self.turns.clone(),
                    partition,
                    turn_id: turn_id.to_string(),
                })
            }
        }
    }

    pub fn is_in_flight(&self, partition: &PartitionKey) -> bool {
        self.turns.contains_key(partition)
    }

    /// Turn currently holding the pair, if any.
    pub fn holder(&self, partition: &PartitionKey) -> Option<String> {
        self.turns.get(partition).map(|id| id.value().clone())
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Exclusive in-flight marker for one pair.
#[derive(Debug)]
pub struct TurnGuard {
    turns: Arc<DashMap<PartitionKey, String>>,
    partition: PartitionKey,
    turn_id: String,
}

impl TurnGuard {
    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.turns
            .remove_if(&self.partition, |_, holder| holder == &self.turn_id);
    }
}
