//! Static node source: a JSON file listing the fleet, polled for changes.
//!
//! The file plays the role of the cluster API. Nodes without an explicit
//! source are attributed to it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use node_manager::{Identity, Manager, Node, Source};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read node list {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse node list {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub struct StaticSource {
    path: PathBuf,
    known: HashMap<Identity, Node>,
    synced: bool,
}

impl StaticSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            known: HashMap::new(),
            synced: false,
        }
    }

    pub async fn load(path: &Path) -> Result<Vec<Node>, SourceError> {
        let contents = tokio::fs::read(path).await.map_err(|source| SourceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut nodes: Vec<Node> =
            serde_json::from_slice(&contents).map_err(|source| SourceError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        for node in &mut nodes {
            if node.source == Source::Unspec {
                node.source = Source::Kubernetes;
            }
        }
        Ok(nodes)
    }

    /// Re-reads the file and feeds the differences to `manager`. The first
    /// successful read completes the initial listing.
    pub async fn apply(&mut self, manager: &Manager) -> Result<(), SourceError> {
        let nodes = Self::load(&self.path).await?;
        let mut seen: HashMap<Identity, Node> = HashMap::with_capacity(nodes.len());

        for node in nodes {
            let identity = node.identity();
            if self.known.get(&identity) != Some(&node) {
                debug!(node = %identity, "node changed in static source");
                manager.node_updated(node.clone());
            }
            seen.insert(identity, node);
        }

        for (identity, node) in self.known.drain() {
            if !seen.contains_key(&identity) {
                debug!(node = %identity, "node removed from static source");
                manager.node_deleted(node);
            }
        }
        self.known = seen;

        if !self.synced {
            self.synced = true;
            info!(count = self.known.len(), "Initial node listing complete");
            manager.node_sync();
            manager.mesh_node_sync();
        }
        Ok(())
    }

    pub async fn run(mut self, manager: Arc<Manager>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.apply(&manager).await {
                error!(path = %self.path.display(), error = %err, "Failed to apply static node source");
            }
        }
    }
}
