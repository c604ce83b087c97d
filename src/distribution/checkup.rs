use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

use crate::ring::{Direction, HashRing, NodeId, VirtualNode};
use crate::storage::ReplicatedStore;

/// Periodically drops replicas this node no longer has to hold.
///
/// A non-owned key is kept only while this node is among the owning virtual node's
/// `replication_factor - 1` successors.
pub struct ConsistencySweep {
    self_id: NodeId,
    replication_factor: usize,
    ring: Arc<HashRing>,
    store: Arc<ReplicatedStore>,
    interval: Duration,
}

impl ConsistencySweep {
    pub fn new(
        self_id: NodeId,
        replication_factor: usize,
        ring: Arc<HashRing>,
        store: Arc<ReplicatedStore>,
        interval: Duration,
    ) -> Self {
        Self {
            self_id,
            replication_factor,
            ring,
            store,
            interval,
        }
    }

    /// One pass over the store. Returns the number of keys removed.
    pub fn run_once(&self) -> usize {
        let ring = self.ring.snapshot();
        let hops = self.replication_factor.saturating_sub(1);
        let mut verdicts: HashMap<VirtualNode, bool> = HashMap::new();
        let mut removed = 0;

        for key in self.store.keys() {
            let Some(vnode) = ring.owning_vnode(&key) else { return 0 };
            if vnode.owner == self.self_id {
                continue;
            }
            let keep = *verdicts.entry(vnode).or_insert_with(|| {
                ring.is_within_distance(&vnode, self.self_id, hops, Direction::Successor)
            });
            if !keep && self.store.remove(&key) {
                removed += 1;
            }
        }
        removed
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let sweep = self.clone();
        tokio::spawn(async move {
            let period = sweep.interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let removed = sweep.run_once();
                info!(removed, remaining = sweep.store.len(), "Consistency sweep finished");
            }
        })
    }
}
