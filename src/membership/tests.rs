//! Membership Module Tests
//!
//! Validates the failure detector's round arithmetic and the coordinator's reaction
//! to topology changes.
//!
//! ## Test Scopes
//! - **Gossip Merge**: Join on first contact, ignoring stale and out-of-range entries.
//! - **Failure Detection**: Suspicion and removal timing, reinstatement, rejoin debouncing.
//! - **Digest Content**: Failed nodes are not advertised.
//! - **Coordination**: Affected partition sets and ring/directory updates.

#[cfg(test)]
mod tests {
    use crate::membership::service::{GossipFailureDetector, GossipSettings};
    use crate::membership::types::{
        DigestEntry, GossipMessage, MembershipEvent, MembershipListener, NodeStatus, counter_is_newer,
    };
    use crate::ring::NodeAddress;
    use crate::server::testing::{TestCluster, test_config};
    use crate::server::transport::MemoryTransport;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<MembershipEvent>>,
    }

    impl MembershipListener for RecordingListener {
        fn on_join(&self, node: &NodeAddress) {
            self.events.lock().push(MembershipEvent::Join(*node));
        }

        fn on_leave(&self, node: &NodeAddress) {
            self.events.lock().push(MembershipEvent::Leave(*node));
        }
    }

    impl RecordingListener {
        fn take(&self) -> Vec<MembershipEvent> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    struct Fixture {
        detector: GossipFailureDetector,
        transport: Arc<MemoryTransport>,
        listener: Arc<RecordingListener>,
        members: Vec<NodeAddress>,
    }

    fn fixture(size: u8, failure_mark: u32, alive_round_limit: u32) -> Fixture {
        let members: Vec<NodeAddress> = (1..=size)
            .map(|i| NodeAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)), 50111, 50222))
            .collect();
        let transport = Arc::new(MemoryTransport::new(members[0].gossip_addr()));
        let listener = Arc::new(RecordingListener::default());
        let detector = GossipFailureDetector::new(
            members[0],
            members.clone(),
            GossipSettings {
                interval: Duration::from_millis(100),
                failure_mark,
                alive_round_limit,
            },
            transport.clone(),
            listener.clone(),
        )
        .unwrap();
        Fixture {
            detector,
            transport,
            listener,
            members,
        }
    }

    fn heard(detector: &GossipFailureDetector, node_index: u32, counter: u64) {
        detector.receive_digest(&[DigestEntry { node_index, counter }]);
    }

    fn rounds(detector: &GossipFailureDetector, count: usize) {
        for _ in 0..count {
            detector.run_round();
        }
    }

    // ============================================================
    // GOSSIP MERGE TESTS
    // ============================================================

    #[test]
    fn test_starts_with_only_self_alive() {
        let f = fixture(3, 8, 1);
        assert_eq!(f.detector.self_index(), 0);
        assert_eq!(f.detector.alive_members(), 1);
        assert_eq!(f.detector.status(0), Some(NodeStatus::Alive));
        assert_eq!(f.detector.status(1), None);
    }

    #[test]
    fn test_first_entry_is_a_join() {
        let f = fixture(3, 8, 1);
        heard(&f.detector, 1, 10);

        assert_eq!(f.listener.take(), vec![MembershipEvent::Join(f.members[1])]);
        assert_eq!(f.detector.alive_members(), 2);

        // Old or repeated counters change nothing.
        heard(&f.detector, 1, 10);
        heard(&f.detector, 1, 9);
        assert!(f.listener.take().is_empty());
        assert_eq!(f.detector.image(1).unwrap().last_peer_counter, 10);
    }

    #[test]
    fn test_ignores_self_and_unknown_indices() {
        let f = fixture(2, 8, 1);
        f.detector.receive_digest(&[
            DigestEntry { node_index: 0, counter: 1 },
            DigestEntry { node_index: 7, counter: 1 },
        ]);
        assert!(f.listener.take().is_empty());
        assert_eq!(f.detector.alive_members(), 1);
    }

    #[test]
    fn test_malformed_datagram_is_ignored() {
        let f = fixture(2, 8, 1);
        f.detector.handle_datagram(&[0xff, 0x01], f.members[1].gossip_addr());
        assert_eq!(f.detector.alive_members(), 1);

        let message = GossipMessage::Digest {
            entries: vec![DigestEntry { node_index: 1, counter: 3 }],
        };
        f.detector
            .handle_datagram(&bincode::serialize(&message).unwrap(), f.members[1].gossip_addr());
        assert_eq!(f.detector.alive_members(), 2);
    }

    #[test]
    fn test_counter_comparison_wraps() {
        assert!(counter_is_newer(2, 1));
        assert!(!counter_is_newer(1, 1));
        assert!(!counter_is_newer(1, 2));
        assert!(counter_is_newer(0, u64::MAX));
        assert!(counter_is_newer(3, u64::MAX - 3));
    }

    // ============================================================
    // FAILURE DETECTION TESTS
    // ============================================================

    #[test]
    fn test_suspicion_then_removal_timing() {
        let f = fixture(2, 8, 1);
        heard(&f.detector, 1, 1);
        f.listener.take();

        rounds(&f.detector, 9);
        assert_eq!(f.detector.status(1), Some(NodeStatus::Alive));
        assert_eq!(f.detector.alive_members(), 2);

        rounds(&f.detector, 1);
        assert_eq!(f.detector.status(1), Some(NodeStatus::Suspected));
        assert_eq!(f.detector.alive_members(), 1, "suspicion lowers the count at once");
        assert!(f.listener.take().is_empty(), "still in the ring while suspected");

        rounds(&f.detector, 2);
        assert!(f.listener.take().is_empty());
        rounds(&f.detector, 1);
        assert_eq!(f.detector.status(1), Some(NodeStatus::Removed));
        assert_eq!(f.listener.take(), vec![MembershipEvent::Leave(f.members[1])]);

        rounds(&f.detector, 20);
        assert!(f.listener.take().is_empty(), "leave is reported once");
        assert_eq!(f.detector.alive_members(), 1);
    }

    #[test]
    fn test_failed_rounds_keep_counting_after_removal() {
        let f = fixture(2, 8, 1);
        heard(&f.detector, 1, 1);
        rounds(&f.detector, 13);
        assert_eq!(f.detector.image(1).unwrap().failed_rounds, 4);
        f.listener.take();

        rounds(&f.detector, 20);
        assert_eq!(f.detector.image(1).unwrap().failed_rounds, 24);
        assert_eq!(f.detector.status(1), Some(NodeStatus::Removed));
        assert!(f.listener.take().is_empty());

        // Rejoining still needs the confirmation streak and starts the count over.
        heard(&f.detector, 1, 2);
        heard(&f.detector, 1, 3);
        assert_eq!(f.detector.status(1), Some(NodeStatus::Alive));
        assert_eq!(f.detector.image(1).unwrap().failed_rounds, 0);
    }

    #[test]
    fn test_suspected_node_is_reinstated_without_join() {
        let f = fixture(2, 8, 1);
        heard(&f.detector, 1, 1);
        f.listener.take();
        rounds(&f.detector, 10);
        assert_eq!(f.detector.status(1), Some(NodeStatus::Suspected));

        heard(&f.detector, 1, 2);
        assert_eq!(f.detector.status(1), Some(NodeStatus::Alive));
        assert_eq!(f.detector.alive_members(), 2);
        assert!(f.listener.take().is_empty());
    }

    #[test]
    fn test_removed_node_needs_repeated_confirmation() {
        let f = fixture(2, 8, 1);
        heard(&f.detector, 1, 1);
        rounds(&f.detector, 13);
        assert_eq!(f.detector.status(1), Some(NodeStatus::Removed));
        f.listener.take();

        heard(&f.detector, 1, 2);
        assert_eq!(f.detector.status(1), Some(NodeStatus::Removed));
        assert_eq!(f.detector.image(1).unwrap().alive_rounds, 1);
        assert!(f.listener.take().is_empty());

        heard(&f.detector, 1, 3);
        assert_eq!(f.detector.status(1), Some(NodeStatus::Alive));
        assert_eq!(f.listener.take(), vec![MembershipEvent::Join(f.members[1])]);
        assert_eq!(f.detector.alive_members(), 2);
    }

    #[test]
    fn test_quiet_confirmation_streak_is_forgotten() {
        let f = fixture(2, 8, 1);
        heard(&f.detector, 1, 1);
        rounds(&f.detector, 13);
        heard(&f.detector, 1, 2);
        assert_eq!(f.detector.image(1).unwrap().alive_rounds, 1);

        // Nine fresh rounds, then eight stale ones.
        rounds(&f.detector, 17);
        assert_eq!(f.detector.image(1).unwrap().alive_rounds, 1);
        rounds(&f.detector, 1);
        let image = f.detector.image(1).unwrap();
        assert_eq!(image.alive_rounds, 0);
        assert_eq!(image.flap_reset_rounds, 0);

        f.listener.take();
        heard(&f.detector, 1, 3);
        assert_eq!(f.detector.status(1), Some(NodeStatus::Removed), "streak starts over");
        assert!(f.listener.take().is_empty());
    }

    // ============================================================
    // DIGEST CONTENT TESTS
    // ============================================================

    fn sent_digest(f: &Fixture) -> Vec<DigestEntry> {
        let (_, bytes) = f.transport.take().pop().expect("a digest was sent");
        let GossipMessage::Digest { entries } = bincode::deserialize(&bytes).unwrap();
        entries
    }

    #[test]
    fn test_digest_carries_self_and_live_peers() {
        let f = fixture(3, 8, 1);
        heard(&f.detector, 1, 40);
        heard(&f.detector, 2, 50);
        f.detector.run_round();

        let entries = sent_digest(&f);
        let indices: Vec<u32> = entries.iter().map(|e| e.node_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(entries[1].counter, 40);
        assert_eq!(entries[2].counter, 50);

        f.detector.run_round();
        let next = sent_digest(&f);
        assert!(counter_is_newer(next[0].counter, entries[0].counter), "own counter advances");
    }

    #[test]
    fn test_failed_peer_is_neither_advertised_nor_targeted() {
        let f = fixture(3, 8, 1);
        heard(&f.detector, 1, 1);
        heard(&f.detector, 2, 1);
        for round in 0..10u64 {
            heard(&f.detector, 1, 2 + round);
            f.detector.run_round();
        }
        assert_eq!(f.detector.status(2), Some(NodeStatus::Suspected));
        f.transport.take();

        for round in 0..20u64 {
            f.detector.run_round();
            let (target, bytes) = f.transport.take().pop().unwrap();
            let GossipMessage::Digest { entries } = bincode::deserialize(&bytes).unwrap();
            assert!(entries.iter().all(|e| e.node_index != 2));
            assert_ne!(target, f.members[2].gossip_addr());
            heard(&f.detector, 1, 100 + round);
        }
    }

    #[test]
    fn test_lone_node_sends_nothing_once_peers_fail() {
        let f = fixture(2, 2, 1);
        heard(&f.detector, 1, 1);
        rounds(&f.detector, 10);
        assert_eq!(f.detector.status(1), Some(NodeStatus::Removed));
        f.transport.take();

        f.detector.run_round();
        assert_eq!(f.transport.sent_count(), 0);
    }

    // ============================================================
    // COORDINATOR TESTS
    // ============================================================

    #[test]
    fn test_affected_partitions_follow_replica_distance() {
        let cluster = TestCluster::connected(3, test_config(2, 1));
        let node = cluster.node(0);
        let own = node.ring.vnodes_of(node.address.id)[0];
        let next = node.ring.successors(&own, 1)[0];
        let other = cluster
            .nodes
            .iter()
            .map(|n| n.node.address.id)
            .find(|id| *id != node.address.id && *id != next)
            .unwrap();

        assert_eq!(node.coordinator.affected_by_join(next).into_iter().collect::<Vec<_>>(), vec![own]);
        assert!(node.coordinator.affected_by_join(other).is_empty());
        // The third node is this one's predecessor.
        assert_eq!(node.coordinator.affected_by_leave(other).into_iter().collect::<Vec<_>>(), vec![own]);
        assert_eq!(node.coordinator.affected_by_leave(next).len(), 1);
    }

    #[test]
    fn test_single_copy_affects_nothing() {
        let cluster = TestCluster::connected(3, test_config(1, 10));
        let node = cluster.node(0);
        for peer in &cluster.nodes[1..] {
            assert!(node.coordinator.affected_by_join(peer.node.address.id).is_empty());
            assert!(node.coordinator.affected_by_leave(peer.node.address.id).is_empty());
        }
    }

    #[tokio::test]
    async fn test_join_and_leave_update_ring_and_directory() {
        let cluster = TestCluster::new(2, test_config(1, 10));
        let node = cluster.node(0);
        let peer = cluster.node(1).address;

        node.coordinator.on_join(&peer);
        assert!(node.ring.contains(peer.id));
        assert_eq!(node.directory.route(peer.id), Some(peer));
        assert_eq!(node.ring.node_count(), 2);

        node.coordinator.on_leave(&peer);
        assert!(!node.ring.contains(peer.id));
        assert_eq!(node.directory.route(peer.id), None);

        node.coordinator.on_leave(&node.address);
        assert!(node.ring.contains(node.address.id), "a node never removes itself");
    }
}
