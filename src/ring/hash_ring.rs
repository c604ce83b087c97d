use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;

use parking_lot::RwLock;

use super::types::{Direction, NodeId, VirtualNode};

/// 64-bit ring coordinate of `bytes`.
///
/// Folds the first 128 bits of the blake3 digest into one word.
pub fn ring_hash(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let raw = digest.as_bytes();
    let mut high = [0u8; 8];
    let mut low = [0u8; 8];
    high.copy_from_slice(&raw[0..8]);
    low.copy_from_slice(&raw[8..16]);
    u64::from_be_bytes(high) ^ u64::from_be_bytes(low)
}

fn vnode_position(owner: NodeId, replica_index: u32) -> u64 {
    let mut seed = [0u8; 12];
    seed[0..4].copy_from_slice(&owner.0.to_be_bytes());
    seed[4..12].copy_from_slice(&(replica_index as u64).to_be_bytes());
    ring_hash(&seed)
}

/// Immutable view of the ring at one point in time.
///
/// Virtual nodes are ordered by `(position, owner, replica_index)`, so two positions
/// that collide keep a deterministic order on every node.
#[derive(Debug, Clone, Default)]
pub struct RingSnapshot {
    vnodes: BTreeSet<VirtualNode>,
    members: HashMap<NodeId, Vec<VirtualNode>>,
}

impl RingSnapshot {
    pub fn is_empty(&self) -> bool {
        self.vnodes.is_empty()
    }

    pub fn vnode_count(&self) -> usize {
        self.vnodes.len()
    }

    pub fn node_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains_key(&node)
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.members.keys().copied().collect();
        nodes.sort();
        nodes
    }

    pub fn vnodes_of(&self, node: NodeId) -> Vec<VirtualNode> {
        self.members.get(&node).cloned().unwrap_or_default()
    }

    /// First virtual node at or clockwise after the hash of `key`.
    pub fn owning_vnode(&self, key: &[u8]) -> Option<VirtualNode> {
        let start = VirtualNode {
            position: ring_hash(key),
            owner: NodeId(0),
            replica_index: 0,
        };
        self.vnodes
            .range(start..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .copied()
    }

    pub fn owner(&self, key: &[u8]) -> Option<NodeId> {
        self.owning_vnode(key).map(|v| v.owner)
    }

    /// One full revolution starting after `from`, excluding `from` itself.
    fn walk<'a>(
        &'a self,
        from: &VirtualNode,
        direction: Direction,
    ) -> Box<dyn Iterator<Item = &'a VirtualNode> + 'a> {
        let from = *from;
        match direction {
            Direction::Successor => Box::new(
                self.vnodes
                    .range((Excluded(from), Unbounded))
                    .chain(self.vnodes.range(..from)),
            ),
            Direction::Predecessor => Box::new(
                self.vnodes
                    .range(..from)
                    .rev()
                    .chain(self.vnodes.range((Excluded(from), Unbounded)).rev()),
            ),
        }
    }

    /// Distinct physical nodes met walking from `from`, skipping its own owner.
    fn distinct_owners(&self, from: &VirtualNode, direction: Direction, limit: usize) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut owners = Vec::new();
        if limit == 0 {
            return owners;
        }
        for vnode in self.walk(from, direction) {
            if vnode.owner == from.owner || !seen.insert(vnode.owner) {
                continue;
            }
            owners.push(vnode.owner);
            if owners.len() == limit {
                break;
            }
        }
        owners
    }

    /// Up to `count` distinct physical nodes clockwise after `vnode`, excluding its owner.
    pub fn successors(&self, vnode: &VirtualNode, count: usize) -> Vec<NodeId> {
        self.distinct_owners(vnode, Direction::Successor, count)
    }

    /// Whether `node` is among the first `max_hops` distinct physical nodes met walking
    /// from `vnode` in `direction`.
    pub fn is_within_distance(
        &self,
        vnode: &VirtualNode,
        node: NodeId,
        max_hops: usize,
        direction: Direction,
    ) -> bool {
        self.distinct_owners(vnode, direction, max_hops).contains(&node)
    }
}

/// Shared, concurrently readable hash ring.
///
/// Readers take a cheap `Arc` snapshot; membership changes build a new snapshot and
/// swap it in.
pub struct HashRing {
    virtual_nodes: u32,
    state: RwLock<Arc<RingSnapshot>>,
}

impl HashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes,
            state: RwLock::new(Arc::new(RingSnapshot::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.state.read().clone()
    }

    /// Places the node's virtual nodes on the ring. Adding a present node is a no-op.
    pub fn add_node(&self, node: NodeId) -> Vec<VirtualNode> {
        let mut guard = self.state.write();
        if let Some(existing) = guard.members.get(&node) {
            return existing.clone();
        }
        let vnodes: Vec<VirtualNode> = (0..self.virtual_nodes)
            .map(|replica_index| VirtualNode {
                position: vnode_position(node, replica_index),
                owner: node,
                replica_index,
            })
            .collect();

        let mut next = RingSnapshot::clone(&guard);
        next.vnodes.extend(vnodes.iter().copied());
        next.members.insert(node, vnodes.clone());
        *guard = Arc::new(next);
        vnodes
    }

    /// Removes all of the node's virtual nodes. Returns whether the node was present.
    pub fn remove_node(&self, node: NodeId) -> bool {
        let mut guard = self.state.write();
        if !guard.members.contains_key(&node) {
            return false;
        }
        let mut next = RingSnapshot::clone(&guard);
        if let Some(vnodes) = next.members.remove(&node) {
            for vnode in vnodes {
                next.vnodes.remove(&vnode);
            }
        }
        *guard = Arc::new(next);
        true
    }

    pub fn owner(&self, key: &[u8]) -> Option<NodeId> {
        self.snapshot().owner(key)
    }

    pub fn owning_vnode(&self, key: &[u8]) -> Option<VirtualNode> {
        self.snapshot().owning_vnode(key)
    }

    pub fn successors(&self, vnode: &VirtualNode, count: usize) -> Vec<NodeId> {
        self.snapshot().successors(vnode, count)
    }

    pub fn is_within_distance(
        &self,
        vnode: &VirtualNode,
        node: NodeId,
        max_hops: usize,
        direction: Direction,
    ) -> bool {
        self.snapshot().is_within_distance(vnode, node, max_hops, direction)
    }

    pub fn vnodes_of(&self, node: NodeId) -> Vec<VirtualNode> {
        self.snapshot().vnodes_of(node)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.snapshot().contains(node)
    }

    pub fn node_count(&self) -> usize {
        self.snapshot().node_count()
    }
}
