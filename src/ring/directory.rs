use dashmap::DashMap;

use super::types::{NodeAddress, NodeId};

/// Maps node ids to the addresses used to reach them.
///
/// The local node is always routable; removing it is ignored.
pub struct NodeDirectory {
    local: NodeAddress,
    routes: DashMap<NodeId, NodeAddress>,
}

impl NodeDirectory {
    pub fn new(local: NodeAddress) -> Self {
        let routes = DashMap::new();
        routes.insert(local.id, local);
        Self { local, routes }
    }

    pub fn insert(&self, node: NodeAddress) {
        self.routes.insert(node.id, node);
    }

    pub fn remove(&self, node: NodeId) {
        if node != self.local.id {
            self.routes.remove(&node);
        }
    }

    pub fn route(&self, node: NodeId) -> Option<NodeAddress> {
        self.routes.get(&node).map(|entry| *entry.value())
    }
}
