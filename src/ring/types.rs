use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::hash_ring::ring_hash;
use crate::protocol::KvError;

/// Port the gossip protocol listens on when a node entry omits it.
pub const DEFAULT_GOSSIP_PORT: u16 = 50222;

/// Stable identity of a physical node, derived from its `host:servicePort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn from_endpoint(host: IpAddr, service_port: u16) -> Self {
        let digest = ring_hash(format!("{host}:{service_port}").as_bytes());
        Self((digest & 0x7FFF_FFFF) as u32)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a node can be reached: one port for requests, one for gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub id: NodeId,
    pub host: IpAddr,
    pub service_port: u16,
    pub gossip_port: u16,
}

impl NodeAddress {
    pub fn new(host: IpAddr, service_port: u16, gossip_port: u16) -> Self {
        Self {
            id: NodeId::from_endpoint(host, service_port),
            host,
            service_port,
            gossip_port,
        }
    }

    pub fn service_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.service_port)
    }

    pub fn gossip_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.gossip_port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.service_port, self.gossip_port)
    }
}

fn resolve_host(host: &str, port: u16) -> Result<IpAddr, KvError> {
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| KvError::InvalidAddress(host.to_string()))
}

/// Parses `host:servicePort[:gossipPort]`.
impl FromStr for NodeAddress {
    type Err = KvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KvError::InvalidAddress(s.to_string());
        let mut parts = s.trim().split(':');
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let service_port: u16 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let gossip_port = match parts.next() {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None => DEFAULT_GOSSIP_PORT,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        let ip = resolve_host(host, service_port)?;
        Ok(Self::new(ip, service_port, gossip_port))
    }
}

/// One position of a physical node on the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualNode {
    pub position: u64,
    pub owner: NodeId,
    pub replica_index: u32,
}

/// Walk direction around the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Successor,
    Predecessor,
}
