use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protocol::{KvError, KvResult};
use crate::ring::NodeId;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Every component of `self` is >= the other's and at least one is greater.
    Larger,
    /// Every component of `self` is <= the other's and at least one is smaller.
    Smaller,
    Equal,
    /// Each clock has a component greater than the other's.
    Concurrent,
}

/// Per-node counters describing the causal history of a stored value.
///
/// Missing components count as zero. Clocks are values: `increment` returns a new
/// clock and leaves the receiver unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: NodeId) -> u64 {
        self.counters.get(&node).copied().unwrap_or(0)
    }

    /// Fails when `node`'s counter is already at `u64::MAX`.
    pub fn increment(&self, node: NodeId) -> KvResult<Self> {
        let mut next = self.clone();
        let counter = next.counters.entry(node).or_insert(0);
        *counter = counter
            .checked_add(1)
            .ok_or_else(|| KvError::Internal(format!("clock counter of node {node} overflowed")))?;
        Ok(next)
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.counters.iter().map(|(node, counter)| (*node, *counter))
    }

    /// Compares over the union of both clocks' components.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut greater = false;
        let mut smaller = false;
        for node in self.counters.keys().chain(other.counters.keys()) {
            let (mine, theirs) = (self.get(*node), other.get(*node));
            if mine > theirs {
                greater = true;
            } else if mine < theirs {
                smaller = true;
            }
            if greater && smaller {
                return ClockOrdering::Concurrent;
            }
        }
        match (greater, smaller) {
            (true, false) => ClockOrdering::Larger,
            (false, true) => ClockOrdering::Smaller,
            (false, false) => ClockOrdering::Equal,
            (true, true) => ClockOrdering::Concurrent,
        }
    }
}

impl FromIterator<(NodeId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (NodeId, u64)>>(iter: I) -> Self {
        Self {
            counters: iter.into_iter().collect(),
        }
    }
}
