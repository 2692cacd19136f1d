use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use node_manager::ManagerConfig;

use crate::commands::CliError;

/// Agent configuration file: the manager settings plus the agent's own.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AgentConfig {
    #[serde(flatten)]
    pub manager: ManagerConfig,
    /// Address of the status API.
    pub listen: SocketAddr,
    /// JSON file listing the fleet's nodes.
    pub nodes_file: Option<PathBuf>,
    /// How often `nodes_file` is re-read, in seconds.
    pub nodes_poll_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            manager: ManagerConfig::default(),
            listen: SocketAddr::from(([127, 0, 0, 1], 9876)),
            nodes_file: None,
            nodes_poll_secs: 10,
        }
    }
}

impl AgentConfig {
    pub async fn load(path: &Path) -> Result<Self, CliError> {
        let contents = tokio::fs::read(path).await.map_err(|source| CliError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&contents).map_err(|source| CliError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }
}
