//! In-memory datapath backends driven by the node manager.

pub mod ipcache;
pub mod ipset;
pub mod routes;

pub use ipcache::{IpCacheStore, ResolvedPrefix};
pub use ipset::IpSetStore;
pub use routes::{Route, RouteError, RouteTable};
