//! Ring Module Tests
//!
//! ## Test Scopes
//! - **Ownership**: Every key has exactly one owner; determinism and wrap-around.
//! - **Successors**: Distinct physical nodes, owner excluded, bounded by membership.
//! - **Addresses**: Parsing of `host:port[:gossipPort]` entries.

#[cfg(test)]
mod tests {
    use crate::ring::{Direction, HashRing, NodeAddress, NodeDirectory, NodeId, ring_hash};
    use std::collections::HashMap;

    fn ring_of(nodes: &[u32], vnodes: u32) -> HashRing {
        let ring = HashRing::new(vnodes);
        for id in nodes {
            ring.add_node(NodeId(*id));
        }
        ring
    }

    // ============================================================
    // OWNERSHIP
    // ============================================================

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = HashRing::new(10);
        assert_eq!(ring.owner(b"anything"), None);
        assert_eq!(ring.owning_vnode(b"anything"), None);
    }

    #[test]
    fn test_single_node_owns_every_key() {
        let ring = ring_of(&[1], 10);
        for i in 0..500 {
            let key = format!("key_{i}");
            assert_eq!(ring.owner(key.as_bytes()), Some(NodeId(1)));
        }
    }

    #[test]
    fn test_ownership_is_deterministic_across_rings() {
        let a = ring_of(&[1, 2, 3], 10);
        let b = ring_of(&[3, 1, 2], 10);
        for i in 0..500 {
            let key = format!("key_{i}");
            assert_eq!(a.owner(key.as_bytes()), b.owner(key.as_bytes()));
        }
    }

    #[test]
    fn test_owning_vnode_is_first_at_or_after_hash() {
        let ring = ring_of(&[1, 2, 3, 4], 10);
        let snapshot = ring.snapshot();
        let mut positions: Vec<u64> = snapshot
            .nodes()
            .into_iter()
            .flat_map(|n| snapshot.vnodes_of(n))
            .map(|v| v.position)
            .collect();
        positions.sort();

        for i in 0..200 {
            let key = format!("k{i}");
            let hash = ring_hash(key.as_bytes());
            let expected = positions
                .iter()
                .find(|p| **p >= hash)
                .copied()
                .unwrap_or(positions[0]);
            assert_eq!(snapshot.owning_vnode(key.as_bytes()).unwrap().position, expected);
        }
    }

    #[test]
    fn test_keys_spread_over_members() {
        let ring = ring_of(&[1, 2, 3], 10);
        let mut counts: HashMap<NodeId, usize> = HashMap::new();
        for i in 0..3000 {
            let key = format!("spread_{i}");
            *counts.entry(ring.owner(key.as_bytes()).unwrap()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3, "every node should own some keys");
    }

    #[test]
    fn test_add_is_idempotent_and_remove_reverts() {
        let ring = ring_of(&[1], 10);
        let before: Vec<_> = (0..100).map(|i| ring.owner(format!("{i}").as_bytes())).collect();

        let first = ring.add_node(NodeId(2));
        let again = ring.add_node(NodeId(2));
        assert_eq!(first, again);
        assert_eq!(ring.snapshot().vnode_count(), 20);

        assert!(ring.remove_node(NodeId(2)));
        assert!(!ring.remove_node(NodeId(2)));
        let after: Vec<_> = (0..100).map(|i| ring.owner(format!("{i}").as_bytes())).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_changes() {
        let ring = ring_of(&[1], 4);
        let snapshot = ring.snapshot();
        ring.add_node(NodeId(2));
        assert_eq!(snapshot.node_count(), 1);
        assert_eq!(ring.node_count(), 2);
    }

    // ============================================================
    // SUCCESSORS & DISTANCE
    // ============================================================

    #[test]
    fn test_successors_are_distinct_and_exclude_owner() {
        let ring = ring_of(&[1, 2, 3, 4], 10);
        for vnode in ring.vnodes_of(NodeId(1)) {
            let successors = ring.successors(&vnode, 2);
            assert_eq!(successors.len(), 2);
            assert_ne!(successors[0], successors[1]);
            assert!(!successors.contains(&NodeId(1)));
        }
    }

    #[test]
    fn test_successors_bounded_by_membership() {
        let ring = ring_of(&[1, 2], 10);
        let vnode = ring.vnodes_of(NodeId(1))[0];
        assert_eq!(ring.successors(&vnode, 5), vec![NodeId(2)]);
        assert!(ring.successors(&vnode, 0).is_empty());

        let alone = ring_of(&[1], 10);
        let vnode = alone.vnodes_of(NodeId(1))[0];
        assert!(alone.successors(&vnode, 2).is_empty());
    }

    #[test]
    fn test_within_distance_matches_successor_list() {
        let ring = ring_of(&[1, 2, 3, 4, 5], 10);
        for vnode in ring.vnodes_of(NodeId(3)) {
            let successors = ring.successors(&vnode, 2);
            for node in [1, 2, 4, 5].map(NodeId) {
                assert_eq!(
                    ring.is_within_distance(&vnode, node, 2, Direction::Successor),
                    successors.contains(&node)
                );
            }
            assert!(!ring.is_within_distance(&vnode, NodeId(3), 2, Direction::Successor));
        }
    }

    #[test]
    fn test_predecessor_walk_is_mirror_of_successor_walk() {
        let ring = ring_of(&[1, 2], 1);
        let one = ring.vnodes_of(NodeId(1))[0];
        let two = ring.vnodes_of(NodeId(2))[0];
        assert!(ring.is_within_distance(&one, NodeId(2), 1, Direction::Predecessor));
        assert!(ring.is_within_distance(&two, NodeId(1), 1, Direction::Predecessor));
        assert!(!ring.is_within_distance(&two, NodeId(1), 0, Direction::Predecessor));
    }

    // ============================================================
    // ADDRESSES
    // ============================================================

    #[test]
    fn test_parse_address_with_and_without_gossip_port() {
        let full: NodeAddress = "127.0.0.1:50111:50333".parse().unwrap();
        assert_eq!(full.service_port, 50111);
        assert_eq!(full.gossip_port, 50333);

        let short: NodeAddress = "localhost:50111".parse().unwrap();
        assert_eq!(short.host.to_string(), "127.0.0.1");
        assert_eq!(short.gossip_port, 50222);
        assert_eq!(short.id, full.id, "id depends only on host and service port");
    }

    #[test]
    fn test_parse_address_rejects_garbage() {
        assert!("".parse::<NodeAddress>().is_err());
        assert!("127.0.0.1".parse::<NodeAddress>().is_err());
        assert!("127.0.0.1:notaport".parse::<NodeAddress>().is_err());
        assert!("127.0.0.1:1:2:3".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn test_node_id_fits_31_bits() {
        for port in 50000..50100 {
            let addr: NodeAddress = format!("10.0.0.1:{port}").parse().unwrap();
            assert!(addr.id.0 <= 0x7FFF_FFFF);
        }
    }

    #[test]
    fn test_directory_keeps_local_route() {
        let local: NodeAddress = "127.0.0.1:50111".parse().unwrap();
        let peer: NodeAddress = "127.0.0.1:50112".parse().unwrap();
        let directory = NodeDirectory::new(local);

        directory.insert(peer);
        assert_eq!(directory.route(peer.id), Some(peer));
        directory.remove(peer.id);
        directory.remove(local.id);
        assert_eq!(directory.route(peer.id), None);
        assert_eq!(directory.route(local.id), Some(local));
    }
}
