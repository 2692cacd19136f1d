pub mod background;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod handler;
pub mod health;
pub mod ipcache;
pub mod ipset;
pub mod labels;
pub mod manager;
pub mod metrics;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod projector;
pub mod store;
pub mod trigger;
pub mod types;


pub use config::ManagerConfig;
pub use error::{CheckpointError, DatapathError, HandlerError, JoinedError};
pub use handler::NodeHandler;
pub use health::{Health, HealthReporter};
pub use ipcache::IpCache;
pub use ipset::{IpSetFilter, IpSetManager};
pub use manager::Manager;
pub use metrics::NodeMetrics;
pub use types::{Address, AddressType, Identity, Node, PrefixCluster, ResourceId, Source};
