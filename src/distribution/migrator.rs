use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::TransferSettings;
use crate::protocol::KvRequest;
use crate::ring::{HashRing, NodeDirectory, NodeId};
use crate::server::client::RetryingClient;
use crate::storage::ReplicatedStore;

#[derive(Default)]
struct PendingJoins {
    nodes: HashSet<NodeId>,
    armed: bool,
}

/// Moves keys to nodes that joined and now own them.
///
/// Joins arriving within one delay window are coalesced into a single scan of the
/// store. Keys are deleted locally as soon as their transfer is handed to the client.
pub struct Migrator {
    ring: Arc<HashRing>,
    directory: Arc<NodeDirectory>,
    store: Arc<ReplicatedStore>,
    client: Arc<RetryingClient>,
    settings: TransferSettings,
    pending: Mutex<PendingJoins>,
    active: Mutex<HashSet<NodeId>>,
}

impl Migrator {
    pub fn new(
        ring: Arc<HashRing>,
        directory: Arc<NodeDirectory>,
        store: Arc<ReplicatedStore>,
        client: Arc<RetryingClient>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            ring,
            directory,
            store,
            client,
            settings,
            pending: Mutex::new(PendingJoins::default()),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Whether `node` is waiting for or receiving migrated keys.
    pub fn is_migrating(&self, node: NodeId) -> bool {
        self.pending.lock().nodes.contains(&node) || self.active.lock().contains(&node)
    }

    pub fn is_migrating_any(&self) -> bool {
        !self.pending.lock().nodes.is_empty() || !self.active.lock().is_empty()
    }

    /// Asks the joined node IS_ALIVE and schedules migration once it answers.
    pub fn migrate(self: &Arc<Self>, node: NodeId) {
        let Some(address) = self.directory.route(node) else {
            tracing::warn!(%node, "No route to joined node, skipping migration");
            return;
        };
        let reply = match self.client.check_alive(address.service_addr()) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(%node, "Could not reach joined node: {}", e);
                return;
            }
        };
        let migrator = self.clone();
        tokio::spawn(async move {
            match reply.await {
                Ok(_) => migrator.schedule(node),
                Err(_) => tracing::debug!(%node, "Joined node never answered IS_ALIVE"),
            }
        });
    }

    /// Adds `node` to the next batch and arms the batch timer if idle.
    pub fn schedule(self: &Arc<Self>, node: NodeId) {
        let arm = {
            let mut pending = self.pending.lock();
            pending.nodes.insert(node);
            !std::mem::replace(&mut pending.armed, true)
        };
        if arm {
            let migrator = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(migrator.settings.delay).await;
                migrator.run_batch().await;
            });
        }
    }

    /// Transfers every local key owned by a pending node. Returns the number moved.
    pub async fn run_batch(&self) -> usize {
        let targets = {
            let mut pending = self.pending.lock();
            pending.armed = false;
            let targets = std::mem::take(&mut pending.nodes);
            self.active.lock().extend(targets.iter().copied());
            targets
        };
        if targets.is_empty() {
            return 0;
        }

        let batch_size = self.settings.batch_size.max(1);
        let mut moved = 0;
        for key in self.store.keys() {
            let Some(owner) = self.ring.owner(&key) else { break };
            if !targets.contains(&owner) {
                continue;
            }
            let Some(entry) = self.store.get(&key) else { continue };
            let Some(address) = self.directory.route(owner) else {
                tracing::warn!(node = %owner, "Migration target vanished from directory");
                continue;
            };

            let request = KvRequest::transfer(&key, &entry.value, entry.version, entry.clock, false);
            match self.client.send(&request, address.service_addr()) {
                Ok(_) => {
                    self.store.remove(&key);
                    moved += 1;
                    if moved % batch_size == 0 {
                        tokio::time::sleep(self.settings.yield_interval).await;
                    }
                }
                Err(e) => tracing::warn!(node = %owner, "Failed to enqueue migrated key: {}", e),
            }
        }

        {
            let mut active = self.active.lock();
            for node in &targets {
                active.remove(node);
            }
        }
        info!(moved, targets = targets.len(), "Migration batch finished");
        moved
    }
}
