//! The node manager: registry, projection, handler fan-out and persistence.
//!
//! Mutating entry points never return errors. Handler and persistence
//! failures are logged and reported to the health sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::background;
use crate::checkpoint::Checkpointer;
use crate::config::ManagerConfig;
use crate::error::{CheckpointError, DatapathError, HandlerError, HandlerOperation, JoinedError};
use crate::handler::{HandlerRegistry, NodeHandler};
use crate::health::{
    Health, SCOPE_CHECKPOINT_WRITER, SCOPE_NODES_ADD, SCOPE_NODES_DELETE, SCOPE_NODES_UPDATE,
};
use crate::ipcache::IpCache;
use crate::ipset::{IpSetFilter, IpSetManager};
use crate::metrics::{EventKind, NodeMetrics};
use crate::projector::{Projection, Projector};
use crate::store::{NodeStore, Removal, Upsert};
use crate::trigger::Trigger;
use crate::types::{Identity, Node, Source};

const CHECKPOINT_TRIGGER_NAME: &str = "node-checkpoint-trigger";

pub struct Manager {
    config: Arc<ManagerConfig>,
    store: NodeStore,
    /// Nodes read from the checkpoint and not yet confirmed live.
    restored: Mutex<HashMap<Identity, Node>>,
    handlers: HandlerRegistry,
    projector: Projector,
    ipset: Arc<dyn IpSetManager>,
    health: Arc<dyn Health>,
    metrics: NodeMetrics,
    checkpointer: Checkpointer,
    checkpoint_trigger: Mutex<Option<Trigger>>,
    /// Serializes checkpoint writes so the final write cannot be overtaken.
    checkpoint_lock: Mutex<()>,
    prune_once: Once,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        ipcache: Arc<dyn IpCache>,
        ipset: Arc<dyn IpSetManager>,
        ipset_filter: Option<IpSetFilter>,
        health: Arc<dyn Health>,
    ) -> Self {
        let config = Arc::new(config);
        let checkpointer = Checkpointer::new(config.state_dir.clone());
        let projector = Projector::new(config.clone(), ipcache, ipset.clone(), ipset_filter);

        Self {
            config,
            store: NodeStore::new(),
            restored: Mutex::new(HashMap::new()),
            handlers: HandlerRegistry::new(),
            projector,
            ipset,
            health,
            metrics: NodeMetrics::new(),
            checkpointer,
            checkpoint_trigger: Mutex::new(None),
            checkpoint_lock: Mutex::new(()),
            prune_once: Once::new(),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn health(&self) -> &dyn Health {
        self.health.as_ref()
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────

    /// Restores the checkpoint, starts the checkpoint writer and spawns the
    /// background validation loop. Must run before live events arrive.
    #[instrument(skip_all, fields(state_dir = %self.config.state_dir.display()))]
    pub fn start(self: &Arc<Self>) -> Result<(), CheckpointError> {
        // Read a potential checkpoint before the writer can overwrite it.
        self.restore_checkpoint();
        self.checkpointer.prepare()?;

        let weak = Arc::downgrade(self);
        let trigger = Trigger::new(
            CHECKPOINT_TRIGGER_NAME,
            self.config.checkpoint_min_interval(),
            move |reasons| {
                if let Some(manager) = weak.upgrade() {
                    manager.write_checkpoint(&reasons);
                }
            },
        );
        *self.checkpoint_trigger.lock() = Some(trigger);

        tokio::spawn(background::run(self.clone(), self.cancel.clone()));
        info!("node manager started");
        Ok(())
    }

    /// Cancels background work and writes one final checkpoint. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        // Without a running writer there is nothing to flush.
        let Some(trigger) = self.checkpoint_trigger.lock().take() else {
            return;
        };
        trigger.shutdown();

        if let Err(err) = self.checkpoint() {
            error!(error = %err, "Failed to write final node checkpoint");
            self.health
                .degraded(SCOPE_CHECKPOINT_WRITER, "failed to write final node checkpoint", &err);
        }
        info!("node manager stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once `stop` has been called, by the owner or by the manager
    /// itself.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    // ─── Node events ──────────────────────────────────────────────────────

    /// Adds or updates a node if its source may overwrite the stored one.
    #[instrument(skip_all, fields(node = %node.identity(), source = %node.source))]
    pub fn node_updated(&self, node: Node) {
        info!(spi = node.encryption_key, "Node updated");
        debug!(node = ?node, "Received node update event");

        if node.source != Source::Restored {
            self.restored.lock().remove(&node.identity());
        }

        let source = node.source;
        match self.store.upsert(node) {
            Upsert::Rejected { owner } => {
                self.metrics.record_event(EventKind::Update, source);
                // Includes a locally discovered node later seen by a watcher.
                debug!(owner = %owner, "Ignoring node update from lower priority source");
                return;
            }
            Upsert::Inserted(guard) => {
                self.metrics.record_event(EventKind::Add, source);
                self.metrics.node_added();
                let projection = self.projector.project(&guard);
                let errs = if projection.datapath_update {
                    self.fan_out(HandlerOperation::Add, &guard, |h| h.node_add(&guard))
                } else {
                    JoinedError::default()
                };
                drop(guard);
                self.report(SCOPE_NODES_ADD, errs, "Node adds successful", "Failed to add nodes");
            }
            Upsert::Updated { old, guard } => {
                self.metrics.record_event(EventKind::Update, source);
                let projection = self.projector.project(&guard);
                if projection.datapath_update {
                    let errs = self.fan_out(HandlerOperation::Update, &guard, |h| {
                        h.node_update(&old, &guard)
                    });
                    self.report(
                        SCOPE_NODES_UPDATE,
                        errs,
                        "Node updates successful",
                        "Failed to update nodes",
                    );
                }
                self.projector.retract(&old, &projection);
                drop(guard);
            }
        }

        self.trigger_checkpoint("NodeUpdate");
    }

    /// Removes a node if `node.source` may overwrite its current owner.
    ///
    /// A restored node is never in the registry; its deletion is synthesized
    /// for handlers only. A cluster API deletion of the local node that is
    /// owned by another source stops the manager.
    #[instrument(skip_all, fields(node = %node.identity(), source = %node.source))]
    pub fn node_deleted(&self, node: Node) {
        info!("Node deleted");
        self.metrics.record_event(EventKind::Delete, node.source);
        let identity = node.identity();

        if node.source == Source::Restored {
            if self.store.contains(&identity) {
                debug!("Restored node is live, skipping synthetic delete");
                return;
            }
            // The IP-cache is rebuilt from scratch on start, nothing to retract.
            let errs = self.fan_out(HandlerOperation::Delete, &node, |h| h.node_delete(&node));
            self.report(
                SCOPE_NODES_DELETE,
                errs,
                "Node deletions successful",
                "Failed to delete nodes",
            );
            return;
        }

        // The cluster API deleting the local node while another source owns
        // it announces the node going away: shut down instead of removing.
        let local_by_cluster_api =
            self.config.is_local(&node) && node.source == Source::Kubernetes;
        let removal = if local_by_cluster_api {
            self.store.remove_if(&identity, |owner| owner == Source::Kubernetes)
        } else {
            self.store.remove(&identity, node.source)
        };

        match removal {
            Removal::Missing => {
                debug!("Ignoring delete event of unknown node");
            }
            Removal::Rejected { owner } if local_by_cluster_api => {
                warn!(owner = %owner, "Cluster API is deleting the local node, stopping node manager");
                self.stop();
            }
            Removal::Rejected { owner } => {
                debug!(owner = %owner, "Ignoring delete event of node");
            }
            Removal::Removed(guard) => {
                self.metrics.node_removed();
                self.projector.retract(&guard, &Projection::default());
                self.trigger_checkpoint("NodeDeleted");
                let errs = self.fan_out(HandlerOperation::Delete, &guard, |h| h.node_delete(&guard));
                drop(guard);
                self.report(
                    SCOPE_NODES_DELETE,
                    errs,
                    "Node deletions successful",
                    "Failed to delete nodes",
                );
            }
        }
    }

    /// Initial listing from the primary source is complete. Prunes restored
    /// nodes of the local cluster, once.
    pub fn node_sync(&self) {
        self.ipset.init_done();
        self.prune_once.call_once(|| self.prune_nodes(false));
    }

    /// Initial listing including remote clusters is complete.
    pub fn mesh_node_sync(&self) {
        self.prune_nodes(true);
    }

    fn prune_nodes(&self, include_meshed: bool) {
        let stale: Vec<Node> = {
            let mut restored = self.restored.lock();
            if restored.is_empty() {
                return;
            }
            // Live nodes are never pruned.
            restored.retain(|id, _| !self.store.contains(id));

            let ids: Vec<Identity> = restored
                .iter()
                .filter(|(_, n)| include_meshed || n.cluster == self.config.cluster_name)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| restored.remove(id)).collect()
        };

        if stale.is_empty() {
            return;
        }
        info!(count = stale.len(), include_meshed, "Deleting stale nodes");
        debug!(
            nodes = ?stale.iter().map(|n| n.identity().to_string()).collect::<Vec<_>>(),
            "stale nodes"
        );

        for node in stale {
            self.node_deleted(node);
        }
    }

    // ─── Handlers ─────────────────────────────────────────────────────────

    /// Subscribes `handler` and replays every known node to it.
    pub fn subscribe(&self, handler: Arc<dyn NodeHandler>) {
        if !self.handlers.insert(handler.clone()) {
            return;
        }
        self.store.for_each(|node| {
            if let Err(err) = handler.node_add(node) {
                error!(
                    handler = handler.name(),
                    node = %node.identity(),
                    error = %err,
                    "Failed applying node handler following initial subscribe"
                );
            }
        });
    }

    pub fn unsubscribe(&self, handler: &Arc<dyn NodeHandler>) {
        self.handlers.remove(handler);
    }

    pub fn iter_handlers(&self, f: impl FnMut(&dyn NodeHandler)) {
        self.handlers.iter(f);
    }

    fn fan_out(
        &self,
        operation: HandlerOperation,
        node: &Node,
        f: impl Fn(&dyn NodeHandler) -> Result<(), DatapathError>,
    ) -> JoinedError {
        let mut errs = JoinedError::default();
        self.handlers.iter(|handler| {
            if let Err(source) = f(handler) {
                error!(
                    handler = handler.name(),
                    node = %node.identity(),
                    %operation,
                    error = %source,
                    "Failed to apply node handler, datapath may be degraded"
                );
                errs.push(HandlerError {
                    handler: handler.name().to_string(),
                    node: node.identity().to_string(),
                    operation,
                    source,
                });
            }
        });
        errs
    }

    fn report(&self, scope: &str, errs: JoinedError, ok: &str, degraded: &str) {
        match errs.into_result() {
            Ok(()) => self.health.ok(scope, ok),
            Err(err) => self.health.degraded(scope, degraded, &err),
        }
    }

    /// Re-asserts one node's datapath state, appending failures to `errs`.
    pub(crate) fn validate_node(&self, identity: &Identity, errs: &mut JoinedError) {
        // The node may have been deleted since the identities were listed.
        let Some(guard) = self.store.lock_entry(identity) else {
            return;
        };
        let failed = self.fan_out(HandlerOperation::Validate, &guard, |h| {
            h.node_validate_implementation(&guard)
        });
        drop(guard);
        self.metrics.record_validation();
        errs.errors.extend(failed.errors);
    }

    // ─── Read accessors ───────────────────────────────────────────────────

    /// Point-in-time copy of every node.
    pub fn get_nodes(&self) -> HashMap<Identity, Node> {
        self.store.snapshot()
    }

    pub fn get_node_identities(&self) -> Vec<Identity> {
        self.store.identities()
    }

    /// Identities restored from the checkpoint and not yet confirmed live.
    pub fn restored_node_identities(&self) -> Vec<Identity> {
        let mut ids: Vec<_> = self.restored.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// `base` scaled by the current fleet size.
    pub fn cluster_size_dependant_interval(&self, base: Duration) -> Duration {
        background::cluster_size_dependant_interval(base, self.store.len())
    }

    pub fn background_sync_interval(&self) -> Duration {
        self.cluster_size_dependant_interval(self.config.background_sync_interval())
    }

    // ─── Checkpoint ───────────────────────────────────────────────────────

    fn restore_checkpoint(&self) {
        match self.checkpointer.restore() {
            Ok(nodes) => {
                let mut restored = self.restored.lock();
                for node in nodes {
                    restored.insert(node.identity(), node);
                }
                info!(count = restored.len(), "restored nodes from checkpoint");
            }
            Err(err) => {
                error!(path = %self.checkpointer.path().display(), error = %err, "failed to restore node checkpoint");
            }
        }
    }

    fn trigger_checkpoint(&self, reason: &str) {
        if let Some(trigger) = self.checkpoint_trigger.lock().as_ref() {
            trigger.trigger_with_reason(reason);
        }
    }

    fn checkpoint(&self) -> Result<(), CheckpointError> {
        let _guard = self.checkpoint_lock.lock();
        self.checkpointer.write(&self.store.nodes())
    }

    fn write_checkpoint(&self, reasons: &[String]) {
        let _guard = self.checkpoint_lock.lock();
        // The final write on stop has already happened or is about to.
        if self.is_stopped() {
            return;
        }
        match self.checkpointer.write(&self.store.nodes()) {
            Ok(()) => self.health.ok(SCOPE_CHECKPOINT_WRITER, "node checkpoint written"),
            Err(err) => {
                error!(error = %err, reasons = ?reasons, "could not write node checkpoint");
                self.health
                    .degraded(SCOPE_CHECKPOINT_WRITER, "failed to write node checkpoint", &err);
            }
        }
    }
}
