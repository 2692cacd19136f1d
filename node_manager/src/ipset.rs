use std::net::IpAddr;
use std::sync::Arc;

use crate::types::Node;

pub const NODE_IPSET_V4: &str = "fleet-node-set-v4";
pub const NODE_IPSET_V6: &str = "fleet-node-set-v6";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Inet,
    Inet6,
}

/// Kernel IP-sets holding the internal addresses of all nodes.
pub trait IpSetManager: Send + Sync {
    fn add_to_ip_set(&self, name: &str, family: Family, addrs: &[IpAddr]);

    fn remove_from_ip_set(&self, name: &str, addrs: &[IpAddr]);

    /// Initial node listing is complete; entries not re-added since start
    /// may now be flushed.
    fn init_done(&self);
}

/// Returns `true` for nodes whose addresses must be kept out of the IP-sets.
pub type IpSetFilter = Arc<dyn Fn(&Node) -> bool + Send + Sync>;

/// Splits addresses per family, preserving order.
pub(crate) fn split_families(addrs: &[IpAddr]) -> (Vec<IpAddr>, Vec<IpAddr>) {
    addrs.iter().partition(|a| a.is_ipv4())
}
