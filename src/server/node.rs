use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::client::RetryingClient;
use super::dedup::DedupCache;
use super::dispatcher::RequestDispatcher;
use super::transport::{Transport, UdpTransport};
use crate::config::NodeConfig;
use crate::distribution::{ConsistencySweep, Migrator, Replicator};
use crate::membership::{GossipFailureDetector, MembershipCoordinator};
use crate::protocol::MAX_DATAGRAM_SIZE;
use crate::ring::{HashRing, NodeAddress, NodeDirectory};
use crate::storage::ReplicatedStore;

/// Outbound channels of a node: service replies, node-to-node client calls and gossip.
pub struct NodeTransports {
    pub service: Arc<dyn Transport>,
    pub client: Arc<dyn Transport>,
    pub gossip: Arc<dyn Transport>,
}

/// A fully wired node. Components are explicitly constructed and shared by `Arc`.
pub struct KvNode {
    pub address: NodeAddress,
    pub ring: Arc<HashRing>,
    pub directory: Arc<NodeDirectory>,
    pub store: Arc<ReplicatedStore>,
    pub cache: Arc<DedupCache>,
    pub client: Arc<RetryingClient>,
    pub migrator: Arc<Migrator>,
    pub replicator: Arc<Replicator>,
    pub coordinator: Arc<MembershipCoordinator>,
    pub detector: Arc<GossipFailureDetector>,
    pub dispatcher: Arc<RequestDispatcher>,
    pub sweep: Arc<ConsistencySweep>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KvNode {
    /// Builds the component graph without touching the network.
    pub fn assemble(
        config: &NodeConfig,
        local: NodeAddress,
        members: Vec<NodeAddress>,
        transports: NodeTransports,
        shutdown: watch::Sender<bool>,
    ) -> Result<Arc<Self>> {
        let rf = config.replication_factor;
        let transfer = config.transfer_settings();

        let ring = Arc::new(HashRing::new(config.virtual_nodes));
        ring.add_node(local.id);
        let directory = Arc::new(NodeDirectory::new(local));
        let store = Arc::new(ReplicatedStore::new(local.id, config.store_capacity_bytes));
        let cache = Arc::new(DedupCache::new(config.dedup_capacity_bytes, config.dedup_ttl()));
        let client = Arc::new(RetryingClient::new(
            local.service_addr(),
            transports.client,
            cache.clone(),
            config.client_settings(),
        ));

        let migrator = Arc::new(Migrator::new(
            ring.clone(),
            directory.clone(),
            store.clone(),
            client.clone(),
            transfer,
        ));
        let replicator = Arc::new(Replicator::new(
            local.id,
            rf,
            ring.clone(),
            directory.clone(),
            store.clone(),
            client.clone(),
            transfer,
        ));
        let coordinator = Arc::new(MembershipCoordinator::new(
            local.id,
            rf,
            ring.clone(),
            directory.clone(),
            migrator.clone(),
            replicator.clone(),
        ));
        let detector = Arc::new(
            GossipFailureDetector::new(
                local,
                members,
                config.gossip_settings(),
                transports.gossip,
                coordinator.clone(),
            )
            .context("local node is missing from the node table")?,
        );
        let dispatcher = Arc::new(RequestDispatcher::new(
            local.id,
            config.dispatcher_settings(),
            transports.service,
            cache.clone(),
            ring.clone(),
            directory.clone(),
            store.clone(),
            client.clone(),
            migrator.clone(),
            detector.clone(),
            shutdown,
        ));
        let sweep = Arc::new(ConsistencySweep::new(
            local.id,
            rf,
            ring.clone(),
            store.clone(),
            config.sweep_interval(),
        ));

        Ok(Arc::new(Self {
            address: local,
            ring,
            directory,
            store,
            cache,
            client,
            migrator,
            replicator,
            coordinator,
            detector,
            dispatcher,
            sweep,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Binds the node's sockets and starts every background task.
    pub async fn start(config: &NodeConfig, shutdown: watch::Sender<bool>) -> Result<Arc<Self>> {
        let local = config.local_address()?;
        let members = config.member_addresses()?;

        let service = UdpTransport::bind(local.service_addr())
            .await
            .with_context(|| format!("failed to bind service port {}", local.service_addr()))?;
        let gossip = UdpTransport::bind(local.gossip_addr())
            .await
            .with_context(|| format!("failed to bind gossip port {}", local.gossip_addr()))?;
        let client = UdpTransport::bind(SocketAddr::new(local.host, 0))
            .await
            .context("failed to bind client socket")?;

        let sockets = (service.socket(), client.socket(), gossip.socket());
        let node = Self::assemble(
            config,
            local,
            members,
            NodeTransports {
                service: Arc::new(service),
                client: Arc::new(client),
                gossip: Arc::new(gossip),
            },
            shutdown,
        )?;

        tracing::info!(
            node = %node.address,
            id = %node.address.id,
            members = node.detector.members().len(),
            "Node starting"
        );
        let tasks = node.spawn_tasks(sockets.0, sockets.1, sockets.2);
        node.tasks.lock().extend(tasks);
        Ok(node)
    }

    /// Aborts the socket loops and periodic tasks started by `start`.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn spawn_tasks(
        self: &Arc<Self>,
        service: Arc<UdpSocket>,
        client: Arc<UdpSocket>,
        gossip: Arc<UdpSocket>,
    ) -> Vec<JoinHandle<()>> {
        let dispatcher = self.dispatcher.clone();
        let service_loop = tokio::spawn(receive_loop(service, "service", move |bytes, src| {
            let dispatcher = dispatcher.clone();
            let bytes = bytes.to_vec();
            tokio::spawn(async move { dispatcher.on_datagram(&bytes, src) });
        }));

        let responses = self.client.clone();
        let client_loop = tokio::spawn(receive_loop(client, "client", move |bytes, _src| {
            responses.on_datagram(bytes)
        }));

        let detector = self.detector.clone();
        let gossip_loop = tokio::spawn(receive_loop(gossip, "gossip", move |bytes, src| {
            detector.handle_datagram(bytes, src)
        }));

        vec![
            service_loop,
            client_loop,
            gossip_loop,
            self.client.start(),
            self.cache.start_sweeper(),
            self.detector.start(),
            self.sweep.start(),
        ]
    }
}

async fn receive_loop<F>(socket: Arc<UdpSocket>, name: &'static str, handler: F)
where
    F: Fn(&[u8], SocketAddr) + Send + 'static,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => handler(&buf[..len], src),
            Err(e) => {
                tracing::error!(socket = name, "Failed to receive UDP packet: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
