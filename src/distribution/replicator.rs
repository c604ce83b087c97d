use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::TransferSettings;
use crate::protocol::KvRequest;
use crate::ring::{HashRing, NodeDirectory, NodeId, VirtualNode};
use crate::server::client::RetryingClient;
use crate::storage::ReplicatedStore;

#[derive(Default)]
struct PendingPartitions {
    vnodes: HashSet<VirtualNode>,
    armed: bool,
}

/// Re-pushes replicas of partitions affected by a topology change.
pub struct Replicator {
    self_id: NodeId,
    replication_factor: usize,
    ring: Arc<HashRing>,
    directory: Arc<NodeDirectory>,
    store: Arc<ReplicatedStore>,
    client: Arc<RetryingClient>,
    settings: TransferSettings,
    pending: Mutex<PendingPartitions>,
}

impl Replicator {
    pub fn new(
        self_id: NodeId,
        replication_factor: usize,
        ring: Arc<HashRing>,
        directory: Arc<NodeDirectory>,
        store: Arc<ReplicatedStore>,
        client: Arc<RetryingClient>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            self_id,
            replication_factor,
            ring,
            directory,
            store,
            client,
            settings,
            pending: Mutex::new(PendingPartitions::default()),
        }
    }

    pub fn pending_partitions(&self) -> usize {
        self.pending.lock().vnodes.len()
    }

    /// Queues `vnodes` for the next batch and arms the batch timer if idle.
    pub fn replicate(self: &Arc<Self>, vnodes: HashSet<VirtualNode>) {
        if vnodes.is_empty() {
            return;
        }
        let arm = {
            let mut pending = self.pending.lock();
            pending.vnodes.extend(vnodes);
            !std::mem::replace(&mut pending.armed, true)
        };
        if arm {
            let replicator = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(replicator.settings.delay).await;
                replicator.run_batch().await;
            });
        }
    }

    /// Pushes replica PUTs for every local key in an affected partition to that
    /// partition's current successors. Returns the number of PUTs sent.
    pub async fn run_batch(&self) -> usize {
        let affected = {
            let mut pending = self.pending.lock();
            pending.armed = false;
            std::mem::take(&mut pending.vnodes)
        };
        let hops = self.replication_factor.saturating_sub(1);
        if affected.is_empty() || hops == 0 {
            return 0;
        }

        let batch_size = self.settings.batch_size.max(1);
        let mut pushed = 0;
        for key in self.store.keys() {
            let ring = self.ring.snapshot();
            let Some(vnode) = ring.owning_vnode(&key) else { break };
            if !affected.contains(&vnode) {
                continue;
            }
            let Some(entry) = self.store.get(&key) else { continue };
            let request = KvRequest::transfer(&key, &entry.value, entry.version, entry.clock, true);

            for successor in ring.successors(&vnode, hops) {
                if successor == self.self_id {
                    continue;
                }
                let Some(address) = self.directory.route(successor) else { continue };
                if let Err(e) = self.client.send(&request, address.service_addr()) {
                    tracing::warn!(node = %successor, "Failed to enqueue replica: {}", e);
                    continue;
                }
                pushed += 1;
                if pushed % batch_size == 0 {
                    tokio::time::sleep(self.settings.yield_interval).await;
                }
            }
        }
        info!(pushed, partitions = affected.len(), "Replication batch finished");
        pushed
    }
}
