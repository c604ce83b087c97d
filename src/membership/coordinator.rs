use std::collections::HashSet;
use std::sync::Arc;

use super::types::MembershipListener;
use crate::distribution::{Migrator, Replicator};
use crate::ring::{Direction, HashRing, NodeAddress, NodeDirectory, NodeId, RingSnapshot, VirtualNode};

/// Applies topology changes to the ring and schedules the data movement they imply.
pub struct MembershipCoordinator {
    self_id: NodeId,
    replication_factor: usize,
    ring: Arc<HashRing>,
    directory: Arc<NodeDirectory>,
    migrator: Arc<Migrator>,
    replicator: Arc<Replicator>,
}

impl MembershipCoordinator {
    pub fn new(
        self_id: NodeId,
        replication_factor: usize,
        ring: Arc<HashRing>,
        directory: Arc<NodeDirectory>,
        migrator: Arc<Migrator>,
        replicator: Arc<Replicator>,
    ) -> Self {
        Self {
            self_id,
            replication_factor,
            ring,
            directory,
            migrator,
            replicator,
        }
    }

    fn replica_hops(&self) -> usize {
        self.replication_factor.saturating_sub(1)
    }

    /// Own virtual nodes having `node` within replica distance in any of `directions`.
    fn affected(&self, ring: &RingSnapshot, node: NodeId, directions: &[Direction]) -> HashSet<VirtualNode> {
        let hops = self.replica_hops();
        if hops == 0 {
            return HashSet::new();
        }
        ring.vnodes_of(self.self_id)
            .into_iter()
            .filter(|vnode| {
                directions
                    .iter()
                    .any(|direction| ring.is_within_distance(vnode, node, hops, *direction))
            })
            .collect()
    }

    /// Own partitions whose successor set now includes the joining node.
    pub fn affected_by_join(&self, joining: NodeId) -> HashSet<VirtualNode> {
        self.affected(&self.ring.snapshot(), joining, &[Direction::Successor])
    }

    /// Own partitions whose successor or predecessor set includes the leaving node.
    pub fn affected_by_leave(&self, leaving: NodeId) -> HashSet<VirtualNode> {
        self.affected(
            &self.ring.snapshot(),
            leaving,
            &[Direction::Successor, Direction::Predecessor],
        )
    }
}

impl MembershipListener for MembershipCoordinator {
    fn on_join(&self, node: &NodeAddress) {
        if node.id == self.self_id {
            return;
        }
        self.directory.insert(*node);
        self.ring.add_node(node.id);
        self.migrator.migrate(node.id);

        let affected = self.affected_by_join(node.id);
        if !affected.is_empty() {
            tracing::debug!(node = %node.id, partitions = affected.len(), "Join affects own partitions");
            self.replicator.replicate(affected);
        }
    }

    fn on_leave(&self, node: &NodeAddress) {
        if node.id == self.self_id {
            return;
        }
        let affected = self.affected_by_leave(node.id);
        if !affected.is_empty() {
            tracing::debug!(node = %node.id, partitions = affected.len(), "Leave affects own partitions");
            self.replicator.replicate(affected);
        }
        self.ring.remove_node(node.id);
        self.directory.remove(node.id);
    }
}
