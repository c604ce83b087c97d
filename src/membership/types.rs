use serde::{Deserialize, Serialize};

use crate::ring::NodeAddress;

/// Liveness bookkeeping for one tracked node.
///
/// `local_clock` is this node's round counter when the peer was last heard from;
/// `last_peer_counter` is the newest counter the peer itself advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemImage {
    pub local_clock: u64,
    pub last_peer_counter: u64,
    pub failed_rounds: u32,
    pub alive_rounds: u32,
    pub flap_reset_rounds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Alive,
    /// Stale but still in the ring.
    Suspected,
    /// Out of the ring; tracked so a return can be debounced.
    Removed,
}

impl SystemImage {
    pub fn new(local_clock: u64, last_peer_counter: u64) -> Self {
        Self {
            local_clock,
            last_peer_counter,
            ..Self::default()
        }
    }

    /// `removal_round` is the failed-round count at which the node leaves the ring.
    pub fn status(&self, removal_round: u32) -> NodeStatus {
        match self.failed_rounds {
            0 => NodeStatus::Alive,
            n if n < removal_round => NodeStatus::Suspected,
            _ => NodeStatus::Removed,
        }
    }
}

/// Topology change reported by the failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    Join(NodeAddress),
    Leave(NodeAddress),
}

/// Receives topology changes. Called outside the detector's lock.
pub trait MembershipListener: Send + Sync {
    fn on_join(&self, node: &NodeAddress);
    fn on_leave(&self, node: &NodeAddress);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub node_index: u32,
    pub counter: u64,
}

/// The wire protocol for the failure detector.
///
/// - `Digest`: the sender's view of every node it currently believes alive,
///   including its own freshly advanced counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage {
    Digest { entries: Vec<DigestEntry> },
}

/// Serial-number comparison: `candidate` is newer than `current` even across
/// wraparound of the 64-bit counter.
pub fn counter_is_newer(candidate: u64, current: u64) -> bool {
    (candidate.wrapping_sub(current) as i64) > 0
}
