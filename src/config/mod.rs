//! Node Configuration
//!
//! Operator tunables for a node. Values come from an optional TOML file and are then
//! overridden by command-line flags in `main.rs`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::distribution::TransferSettings;
use crate::membership::GossipSettings;
use crate::ring::NodeAddress;
use crate::server::client::ClientSettings;
use crate::server::dispatcher::DispatcherSettings;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:50111:50222";

/// Retries double the timeout each time, so the count is kept well short of overflow.
pub const MAX_CLIENT_RETRIES: u32 = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node as `host:servicePort[:gossipPort]`.
    pub listen: String,
    /// Every node of the cluster, this one included. Empty means a single-node cluster.
    pub members: Vec<String>,
    pub replication_factor: usize,
    pub virtual_nodes: u32,
    pub store_capacity_bytes: usize,
    pub dedup_capacity_bytes: usize,
    pub dedup_ttl_ms: u64,
    pub gossip_interval_ms: u64,
    pub failure_mark: u32,
    pub alive_round_limit: u32,
    pub migration_delay_ms: u64,
    pub migration_batch_size: usize,
    pub migration_yield_ms: u64,
    pub sweep_interval_ms: u64,
    pub client_initial_timeout_ms: u64,
    pub client_max_retries: u32,
    pub overload_wait_ms: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            members: Vec::new(),
            replication_factor: 3,
            virtual_nodes: 10,
            store_capacity_bytes: 40 * 1024 * 1024,
            dedup_capacity_bytes: 8 * 1024 * 1024,
            dedup_ttl_ms: 5_000,
            gossip_interval_ms: 2_000,
            failure_mark: 16,
            alive_round_limit: 1,
            migration_delay_ms: 10_000,
            migration_batch_size: 100,
            migration_yield_ms: 100,
            sweep_interval_ms: 300_000,
            client_initial_timeout_ms: 400,
            client_max_retries: 3,
            overload_wait_ms: 100,
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid node configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    /// Parses a node-list file: one `host:port[:gossipPort]` per line. Blank lines and
    /// lines starting with `#` are skipped.
    pub fn parse_node_list(text: &str) -> Vec<String> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    pub fn local_address(&self) -> Result<NodeAddress> {
        self.listen
            .parse()
            .with_context(|| format!("invalid listen address `{}`", self.listen))
    }

    /// The sorted, de-duplicated node table. A node's position in it is its node index.
    pub fn member_addresses(&self) -> Result<Vec<NodeAddress>> {
        let mut members = if self.members.is_empty() {
            vec![self.local_address()?]
        } else {
            self.members
                .iter()
                .map(|entry| {
                    entry
                        .parse::<NodeAddress>()
                        .with_context(|| format!("invalid member address `{entry}`"))
                })
                .collect::<Result<Vec<_>>>()?
        };
        members.sort_by_key(|member| member.to_string());
        members.dedup_by_key(|member| member.id);
        Ok(members)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            bail!("replication_factor must be at least 1");
        }
        if self.virtual_nodes == 0 {
            bail!("virtual_nodes must be at least 1");
        }
        if self.failure_mark < 2 {
            bail!("failure_mark must be at least 2");
        }
        for (name, value) in [
            ("gossip_interval_ms", self.gossip_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("client_initial_timeout_ms", self.client_initial_timeout_ms),
            ("dedup_ttl_ms", self.dedup_ttl_ms),
        ] {
            if value == 0 {
                bail!("{name} must be at least 1");
            }
        }
        if self.client_max_retries > MAX_CLIENT_RETRIES {
            bail!("client_max_retries must be at most {MAX_CLIENT_RETRIES}");
        }
        let local = self.local_address()?;
        if !self.member_addresses()?.iter().any(|m| m.id == local.id) {
            bail!("listen address {} is not among the configured members", self.listen);
        }
        Ok(())
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn gossip_settings(&self) -> GossipSettings {
        GossipSettings {
            interval: Duration::from_millis(self.gossip_interval_ms),
            failure_mark: self.failure_mark,
            alive_round_limit: self.alive_round_limit,
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            initial_timeout: Duration::from_millis(self.client_initial_timeout_ms),
            max_retries: self.client_max_retries,
            overload_wait_ms: self.overload_wait_ms,
        }
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            delay: Duration::from_millis(self.migration_delay_ms),
            batch_size: self.migration_batch_size,
            yield_interval: Duration::from_millis(self.migration_yield_ms),
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            replication_factor: self.replication_factor,
            overload_wait_ms: self.overload_wait_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.member_addresses().unwrap().len(), 1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NodeConfig::from_toml_str(
            r#"
            listen = "127.0.0.1:6000:6001"
            members = ["127.0.0.1:6002", "127.0.0.1:6000:6001"]
            replication_factor = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.replication_factor, 2);
        assert_eq!(config.virtual_nodes, 10);
        assert_eq!(config.failure_mark, 16);
        config.validate().unwrap();
    }

    #[test]
    fn test_member_table_is_sorted_and_deduplicated() {
        let config = NodeConfig {
            listen: "10.0.0.2:5000".into(),
            members: vec![
                "10.0.0.3:5000".into(),
                "10.0.0.2:5000".into(),
                "10.0.0.1:5000".into(),
                "10.0.0.3:5000".into(),
            ],
            ..NodeConfig::default()
        };
        let members = config.member_addresses().unwrap();
        let hosts: Vec<String> = members.iter().map(|m| m.host.to_string()).collect();
        assert_eq!(hosts, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad = [
            NodeConfig { replication_factor: 0, ..NodeConfig::default() },
            NodeConfig { virtual_nodes: 0, ..NodeConfig::default() },
            NodeConfig { failure_mark: 1, ..NodeConfig::default() },
            NodeConfig { gossip_interval_ms: 0, ..NodeConfig::default() },
            NodeConfig { sweep_interval_ms: 0, ..NodeConfig::default() },
            NodeConfig { client_initial_timeout_ms: 0, ..NodeConfig::default() },
            NodeConfig { dedup_ttl_ms: 0, ..NodeConfig::default() },
            NodeConfig { client_max_retries: MAX_CLIENT_RETRIES + 1, ..NodeConfig::default() },
            NodeConfig {
                members: vec!["127.0.0.1:6000".into()],
                ..NodeConfig::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?}");
        }

        let edge = NodeConfig {
            client_max_retries: MAX_CLIENT_RETRIES,
            migration_delay_ms: 0,
            migration_yield_ms: 0,
            ..NodeConfig::default()
        };
        edge.validate().unwrap();
    }

    #[test]
    fn test_node_list_parsing() {
        let list = NodeConfig::parse_node_list("localhost:50111\n\n# spare\n 127.0.0.1:50112:50223 \n");
        assert_eq!(list, ["localhost:50111", "127.0.0.1:50112:50223"]);
    }
}
