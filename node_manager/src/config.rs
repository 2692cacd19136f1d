//! Manager configuration.
//!
//! Every field has a default so a partial JSON document is a valid config.
//! The IP-set exclusion predicate is not serializable and is passed to the
//! manager separately (see [`crate::ipset::IpSetFilter`]).

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Node;

/// File name of the node checkpoint inside the state directory.
pub const NODES_FILENAME: &str = "nodes.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ManagerConfig {
    /// Name of the cluster this agent runs in.
    pub cluster_name: String,
    /// Name of the node this agent runs on.
    pub node_name: String,
    /// Directory holding the node checkpoint.
    pub state_dir: PathBuf,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    /// Tunnel underlay runs over IPv6.
    pub underlay_ipv6: bool,
    pub enable_node_encryption: bool,
    /// The local node opted out of node-to-node encryption.
    pub node_encryption_opt_out: bool,
    pub enable_wireguard: bool,
    pub enable_host_firewall: bool,
    /// Policies may select nodes by CIDR.
    pub policy_cidr_match_nodes: bool,
    pub per_node_labels: bool,
    /// Scope overlay, health, ingress and pod prefixes by the node's cluster id.
    pub cluster_scoped_prefixes: bool,
    /// Router addresses of the local node; never suppress datapath updates.
    pub local_router_ips: Vec<IpAddr>,
    /// Base interval of the background validation loop.
    pub background_sync_interval_ms: u64,
    /// Minimum time between two checkpoint writes.
    pub checkpoint_min_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            node_name: "localhost".to_string(),
            state_dir: PathBuf::from("/run/fleetnode/state"),
            enable_ipv4: true,
            enable_ipv6: false,
            underlay_ipv6: false,
            enable_node_encryption: false,
            node_encryption_opt_out: false,
            enable_wireguard: false,
            enable_host_firewall: false,
            policy_cidr_match_nodes: false,
            per_node_labels: false,
            cluster_scoped_prefixes: false,
            local_router_ips: Vec::new(),
            background_sync_interval_ms: 60_000,
            checkpoint_min_interval_ms: 60_000,
        }
    }
}

impl ManagerConfig {
    pub fn is_local(&self, node: &Node) -> bool {
        node.name == self.node_name && node.cluster == self.cluster_name
    }

    pub fn is_local_router_ip(&self, ip: &IpAddr) -> bool {
        self.local_router_ips.contains(ip)
    }

    pub fn dual_stack(&self) -> bool {
        self.enable_ipv4 && self.enable_ipv6
    }

    pub fn background_sync_interval(&self) -> Duration {
        Duration::from_millis(self.background_sync_interval_ms)
    }

    pub fn checkpoint_min_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_min_interval_ms)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join(NODES_FILENAME)
    }
}
