//! Mock collaborators for unit testing.
//!
//! Provides [`MockIpCache`], [`MockIpSet`] and [`MockHandler`]: in-memory
//! implementations of the collaborator traits that record what was called
//! so tests can assert on the resulting state and call counts. Handler
//! failures can be injected via [`MockHandlerConfig`].

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::DatapathError;
use crate::handler::NodeHandler;
use crate::ipcache::{IpCache, MetadataUpdate, PrefixMetadata};
use crate::ipset::{Family, IpSetManager};
use crate::labels::Labels;
use crate::types::{Identity, Node, PrefixCluster, ResourceId, Source};

// ─── IP-cache ─────────────────────────────────────────────────────────────

type Contributions = BTreeMap<PrefixCluster, BTreeMap<ResourceId, (Source, PrefixMetadata)>>;

/// IP-cache keeping every resource's contribution per prefix.
#[derive(Debug, Default)]
pub struct MockIpCache {
    contributions: Mutex<Contributions>,
    overrides: Mutex<BTreeMap<(PrefixCluster, ResourceId), Labels>>,
    revision: AtomicU64,
    pub upserts: AtomicUsize,
    pub removes: AtomicUsize,
}

impl MockIpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a contribution from some other resource, bypassing call counters.
    pub fn seed(&self, prefix: PrefixCluster, source: Source, resource: &ResourceId) {
        self.contributions
            .lock()
            .entry(prefix)
            .or_default()
            .insert(resource.clone(), (source, PrefixMetadata::default()));
    }

    pub fn prefixes_of(&self, resource: &ResourceId) -> BTreeSet<PrefixCluster> {
        self.contributions
            .lock()
            .iter()
            .filter(|(_, owners)| owners.contains_key(resource))
            .map(|(prefix, _)| *prefix)
            .collect()
    }

    pub fn metadata(&self, prefix: &PrefixCluster, resource: &ResourceId) -> Option<(Source, PrefixMetadata)> {
        self.contributions
            .lock()
            .get(prefix)
            .and_then(|owners| owners.get(resource).cloned())
    }

    pub fn has_override(&self, prefix: &PrefixCluster, resource: &ResourceId) -> bool {
        self.overrides
            .lock()
            .contains_key(&(*prefix, resource.clone()))
    }

    /// Full contribution state, for before/after comparisons.
    pub fn dump(&self) -> Contributions {
        self.contributions.lock().clone()
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::Relaxed)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::Relaxed)
    }

    fn insert(&self, prefix: PrefixCluster, source: Source, resource: &ResourceId, metadata: PrefixMetadata) {
        self.upserts.fetch_add(1, Ordering::Relaxed);
        self.contributions
            .lock()
            .entry(prefix)
            .or_default()
            .insert(resource.clone(), (source, metadata));
    }

    fn delete(&self, prefix: PrefixCluster, resource: &ResourceId) {
        self.removes.fetch_add(1, Ordering::Relaxed);
        let mut contributions = self.contributions.lock();
        if let Some(owners) = contributions.get_mut(&prefix) {
            owners.remove(resource);
            if owners.is_empty() {
                contributions.remove(&prefix);
            }
        }
    }
}

impl IpCache for MockIpCache {
    fn metadata_source(&self, prefix: &PrefixCluster) -> Source {
        self.contributions
            .lock()
            .get(prefix)
            .and_then(|owners| owners.values().map(|(s, _)| *s).max())
            .unwrap_or_default()
    }

    fn upsert_metadata(&self, prefix: PrefixCluster, source: Source, resource: &ResourceId, metadata: PrefixMetadata) {
        self.insert(prefix, source, resource, metadata);
    }

    fn remove_metadata(&self, prefix: PrefixCluster, resource: &ResourceId, _metadata: PrefixMetadata) {
        self.delete(prefix, resource);
    }

    fn override_identity(&self, prefix: PrefixCluster, labels: Labels, _source: Source, resource: &ResourceId) {
        self.overrides.lock().insert((prefix, resource.clone()), labels);
    }

    fn remove_identity_override(&self, prefix: PrefixCluster, _labels: Labels, resource: &ResourceId) {
        self.overrides.lock().remove(&(prefix, resource.clone()));
    }

    fn upsert_metadata_batch(&self, updates: Vec<MetadataUpdate>) -> u64 {
        for u in updates {
            self.insert(u.prefix, u.source, &u.resource, u.metadata);
        }
        self.revision.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn remove_metadata_batch(&self, updates: Vec<MetadataUpdate>) -> u64 {
        for u in updates {
            self.delete(u.prefix, &u.resource);
        }
        self.revision.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// ─── IP-sets ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MockIpSet {
    sets: Mutex<BTreeMap<String, BTreeSet<IpAddr>>>,
    pub init_done_calls: AtomicUsize,
}

impl MockIpSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members(&self, name: &str) -> BTreeSet<IpAddr> {
        self.sets.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn init_done_count(&self) -> usize {
        self.init_done_calls.load(Ordering::Relaxed)
    }
}

impl IpSetManager for MockIpSet {
    fn add_to_ip_set(&self, name: &str, _family: Family, addrs: &[IpAddr]) {
        self.sets
            .lock()
            .entry(name.to_string())
            .or_default()
            .extend(addrs.iter().copied());
    }

    fn remove_from_ip_set(&self, name: &str, addrs: &[IpAddr]) {
        if let Some(set) = self.sets.lock().get_mut(name) {
            for addr in addrs {
                set.remove(addr);
            }
        }
    }

    fn init_done(&self) {
        self.init_done_calls.fetch_add(1, Ordering::Relaxed);
    }
}

// ─── Configuration for failure injection ──────────────────────────────────

/// Controls which callbacks should fail in the mock.
/// All default to `None` (success).
#[derive(Debug, Clone, Default)]
pub struct MockHandlerConfig {
    pub add_error: Option<String>,
    pub update_error: Option<String>,
    pub delete_error: Option<String>,
    pub validate_error: Option<String>,
    /// Sleep this long inside every callback.
    pub delay: Option<Duration>,
}

// ─── Call tracker ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MockCallTracker {
    pub adds: Arc<AtomicUsize>,
    pub updates: Arc<AtomicUsize>,
    pub deletes: Arc<AtomicUsize>,
    pub validates: Arc<AtomicUsize>,
    /// Identities seen per callback, in call order.
    pub events: Arc<Mutex<Vec<(&'static str, Identity)>>>,
}

impl MockCallTracker {
    pub fn add_count(&self) -> usize {
        self.adds.load(Ordering::Relaxed)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn validate_count(&self) -> usize {
        self.validates.load(Ordering::Relaxed)
    }

    /// Identities that received a delete callback.
    pub fn deleted(&self) -> Vec<Identity> {
        self.events
            .lock()
            .iter()
            .filter(|(op, _)| *op == "delete")
            .map(|(_, id)| id.clone())
            .collect()
    }
}

// ─── Mock handler ─────────────────────────────────────────────────────────

pub struct MockHandler {
    name: String,
    tracker: MockCallTracker,
    config: MockHandlerConfig,
    last_update: Mutex<Option<(Node, Node)>>,
}

#[derive(Debug, thiserror::Error)]
#[error("mock error: {0}")]
pub struct MockHandlerError(pub String);

impl MockHandler {
    pub fn new(name: &str) -> Self {
        Self::with_config(name, MockHandlerConfig::default())
    }

    pub fn with_config(name: &str, config: MockHandlerConfig) -> Self {
        Self {
            name: name.to_string(),
            tracker: MockCallTracker::default(),
            config,
            last_update: Mutex::new(None),
        }
    }

    pub fn tracker(&self) -> MockCallTracker {
        self.tracker.clone()
    }

    pub fn last_update(&self) -> Option<(Node, Node)> {
        self.last_update.lock().clone()
    }

    fn record(&self, op: &'static str, counter: &AtomicUsize, node: &Node, error: &Option<String>) -> Result<(), DatapathError> {
        counter.fetch_add(1, Ordering::Relaxed);
        self.tracker.events.lock().push((op, node.identity()));
        if let Some(delay) = self.config.delay {
            std::thread::sleep(delay);
        }
        match error {
            Some(e) => Err(Box::new(MockHandlerError(e.clone()))),
            None => Ok(()),
        }
    }
}

impl NodeHandler for MockHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_add(&self, node: &Node) -> Result<(), DatapathError> {
        self.record("add", &self.tracker.adds, node, &self.config.add_error)
    }

    fn node_update(&self, old: &Node, new: &Node) -> Result<(), DatapathError> {
        *self.last_update.lock() = Some((old.clone(), new.clone()));
        self.record("update", &self.tracker.updates, new, &self.config.update_error)
    }

    fn node_delete(&self, node: &Node) -> Result<(), DatapathError> {
        self.record("delete", &self.tracker.deletes, node, &self.config.delete_error)
    }

    fn node_validate_implementation(&self, node: &Node) -> Result<(), DatapathError> {
        self.record("validate", &self.tracker.validates, node, &self.config.validate_error)
    }
}
