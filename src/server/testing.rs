//! In-memory cluster harness.
//!
//! Nodes are wired with `MemoryTransport`s; `pump` moves recorded datagrams between
//! them until the cluster is quiet. Datagrams addressed outside the cluster (clients)
//! are collected for assertions.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::watch;

use super::node::{KvNode, NodeTransports};
use super::transport::{MemoryTransport, Transport};
use crate::config::NodeConfig;
use crate::protocol::{Envelope, KvRequest, KvResponse, RequestId};
use crate::ring::{NodeAddress, NodeId};

pub const CLIENT_PORT: u16 = 40000;

pub struct TestNode {
    pub node: Arc<KvNode>,
    pub service: Arc<MemoryTransport>,
    pub client: Arc<MemoryTransport>,
    pub gossip: Arc<MemoryTransport>,
    pub shutdown: watch::Receiver<bool>,
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub inbox: Vec<(SocketAddr, Vec<u8>)>,
}

pub fn test_config(replication_factor: usize, virtual_nodes: u32) -> NodeConfig {
    NodeConfig {
        replication_factor,
        virtual_nodes,
        migration_delay_ms: 1_000,
        migration_yield_ms: 10,
        ..NodeConfig::default()
    }
}

pub fn external_client(n: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 0, n)), 7000)
}

impl TestCluster {
    /// `size` nodes that know only themselves.
    pub fn new(size: usize, config: NodeConfig) -> Self {
        let addresses: Vec<NodeAddress> = (0..size)
            .map(|i| NodeAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i as u8 + 1)), 50111, 50222))
            .collect();
        let mut members = addresses.clone();
        members.sort_by_key(|m| m.to_string());

        let nodes = addresses
            .iter()
            .map(|address| {
                let service = Arc::new(MemoryTransport::new(address.service_addr()));
                let client = Arc::new(MemoryTransport::new(SocketAddr::new(address.host, CLIENT_PORT)));
                let gossip = Arc::new(MemoryTransport::new(address.gossip_addr()));
                let (tx, rx) = watch::channel(false);
                let node = KvNode::assemble(
                    &config,
                    *address,
                    members.clone(),
                    NodeTransports {
                        service: service.clone(),
                        client: client.clone(),
                        gossip: gossip.clone(),
                    },
                    tx,
                )
                .unwrap();
                TestNode {
                    node,
                    service,
                    client,
                    gossip,
                    shutdown: rx,
                }
            })
            .collect();

        Self {
            nodes,
            inbox: Vec::new(),
        }
    }

    /// Same cluster with every node already in every ring and directory.
    pub fn connected(size: usize, config: NodeConfig) -> Self {
        let cluster = Self::new(size, config);
        for member in &cluster.nodes {
            for peer in &cluster.nodes {
                member.node.ring.add_node(peer.node.address.id);
                member.node.directory.insert(peer.node.address);
            }
        }
        cluster
    }

    pub fn node(&self, index: usize) -> &Arc<KvNode> {
        &self.nodes[index].node
    }

    pub fn index_of(&self, id: NodeId) -> usize {
        self.nodes
            .iter()
            .position(|n| n.node.address.id == id)
            .unwrap()
    }

    /// Delivers `request` to node `to` as if sent by `from`.
    pub fn send(&self, to: usize, from: SocketAddr, request: &KvRequest) -> RequestId {
        let id = RequestId::generate(from);
        self.send_with_id(to, from, id, request);
        id
    }

    pub fn send_with_id(&self, to: usize, from: SocketAddr, id: RequestId, request: &KvRequest) {
        let bytes = Envelope::new(id, request.encode().unwrap()).encode().unwrap();
        self.nodes[to].node.dispatcher.on_datagram(&bytes, from);
    }

    fn drain(&self) -> Vec<(SocketAddr, SocketAddr, Vec<u8>)> {
        let mut outbound = Vec::new();
        for member in &self.nodes {
            for transport in [&member.service, &member.client, &member.gossip] {
                let from = transport.local_addr();
                outbound.extend(transport.take().into_iter().map(|(dest, bytes)| (from, dest, bytes)));
            }
        }
        outbound
    }

    /// Routes datagrams until no node has anything left to send. Returns how many
    /// datagrams were moved.
    pub fn pump(&mut self) -> usize {
        let mut moved = 0;
        for _ in 0..1_000 {
            let batch = self.drain();
            if batch.is_empty() {
                break;
            }
            moved += batch.len();
            for (from, dest, bytes) in batch {
                self.route(from, dest, bytes);
            }
        }
        moved
    }

    fn route(&mut self, from: SocketAddr, dest: SocketAddr, bytes: Vec<u8>) {
        for member in &self.nodes {
            let address = member.node.address;
            if dest == address.service_addr() {
                member.node.dispatcher.on_datagram(&bytes, from);
                return;
            }
            if dest == member.client.local_addr() {
                member.node.client.on_datagram(&bytes);
                return;
            }
            if dest == address.gossip_addr() {
                member.node.detector.handle_datagram(&bytes, from);
                return;
            }
        }
        self.inbox.push((dest, bytes));
    }

    /// Removes and decodes every response delivered to `client`.
    pub fn responses_for(&mut self, client: SocketAddr) -> Vec<(RequestId, KvResponse)> {
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.inbox)
            .into_iter()
            .partition(|(dest, _)| *dest == client);
        self.inbox = rest;
        mine.into_iter()
            .map(|(_, bytes)| {
                let envelope = Envelope::decode(&bytes).unwrap();
                (envelope.id, KvResponse::decode(&envelope.payload).unwrap())
            })
            .collect()
    }
}
