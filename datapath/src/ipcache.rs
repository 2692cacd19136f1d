//! Multi-owner prefix table backing the node manager's IP-cache.
//!
//! Every prefix keeps one contribution per resource. The resolved view of a
//! prefix takes forwarding metadata from the highest-priority contribution
//! and the union of all contributed labels, unless an identity override is
//! installed.

use std::collections::BTreeMap;
use std::net::IpAddr;

use parking_lot::RwLock;
use tracing::{debug, trace};

use node_manager::ipcache::{IpCache, MetadataUpdate, PrefixMetadata};
use node_manager::labels::Labels;
use node_manager::{PrefixCluster, ResourceId, Source};

#[derive(Debug, Clone)]
struct Contribution {
    source: Source,
    metadata: PrefixMetadata,
}

#[derive(Debug, Default)]
struct Inner {
    prefixes: BTreeMap<PrefixCluster, BTreeMap<ResourceId, Contribution>>,
    overrides: BTreeMap<PrefixCluster, BTreeMap<ResourceId, (Source, Labels)>>,
    revision: u64,
}

/// What the datapath sees for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPrefix {
    pub source: Source,
    pub labels: Labels,
    pub tunnel_peer: Option<IpAddr>,
    pub encrypt_key: u8,
    /// Labels come from an identity override instead of the contributions.
    pub overridden: bool,
}

#[derive(Debug, Default)]
pub struct IpCacheStore {
    inner: RwLock<Inner>,
}

impl IpCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revision of the last applied mutation.
    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    pub fn len(&self) -> usize {
        self.inner.read().prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resolve(&self, prefix: &PrefixCluster) -> Option<ResolvedPrefix> {
        let inner = self.inner.read();
        let owners = inner.prefixes.get(prefix)?;
        // Ties between equal sources go to the first resource in key order.
        let winner = owners
            .values()
            .reduce(|best, c| if c.source > best.source { c } else { best })?;

        let override_labels = inner.overrides.get(prefix).and_then(|o| {
            o.values()
                .reduce(|best, c| if c.0 > best.0 { c } else { best })
                .map(|(_, labels)| labels.clone())
        });
        let overridden = override_labels.is_some();
        let labels = override_labels.unwrap_or_else(|| {
            let mut labels = Labels::new();
            for c in owners.values() {
                labels.merge(&c.metadata.labels);
            }
            labels
        });

        Some(ResolvedPrefix {
            source: winner.source,
            labels,
            tunnel_peer: winner.metadata.tunnel_peer,
            encrypt_key: winner.metadata.encrypt_key,
            overridden,
        })
    }

    /// All prefixes a resource currently contributes to.
    pub fn prefixes_of(&self, resource: &ResourceId) -> Vec<PrefixCluster> {
        self.inner
            .read()
            .prefixes
            .iter()
            .filter(|(_, owners)| owners.contains_key(resource))
            .map(|(prefix, _)| *prefix)
            .collect()
    }

    /// Resolved view of every prefix, in prefix order.
    pub fn dump(&self) -> Vec<(PrefixCluster, ResolvedPrefix)> {
        let prefixes: Vec<PrefixCluster> = self.inner.read().prefixes.keys().copied().collect();
        prefixes
            .into_iter()
            .filter_map(|p| self.resolve(&p).map(|r| (p, r)))
            .collect()
    }

    fn insert(inner: &mut Inner, update: MetadataUpdate) {
        trace!(prefix = %update.prefix, resource = %update.resource, source = %update.source, "upsert prefix metadata");
        inner.prefixes.entry(update.prefix).or_default().insert(
            update.resource,
            Contribution {
                source: update.source,
                metadata: update.metadata,
            },
        );
    }

    fn delete(inner: &mut Inner, prefix: &PrefixCluster, resource: &ResourceId) {
        let Some(owners) = inner.prefixes.get_mut(prefix) else {
            return;
        };
        if owners.remove(resource).is_some() {
            trace!(%prefix, %resource, "removed prefix metadata");
        }
        if owners.is_empty() {
            inner.prefixes.remove(prefix);
            debug!(%prefix, "prefix released");
        }
    }
}

impl IpCache for IpCacheStore {
    fn metadata_source(&self, prefix: &PrefixCluster) -> Source {
        self.inner
            .read()
            .prefixes
            .get(prefix)
            .and_then(|owners| owners.values().map(|c| c.source).max())
            .unwrap_or_default()
    }

    fn upsert_metadata(
        &self,
        prefix: PrefixCluster,
        source: Source,
        resource: &ResourceId,
        metadata: PrefixMetadata,
    ) {
        let mut inner = self.inner.write();
        Self::insert(
            &mut inner,
            MetadataUpdate {
                prefix,
                source,
                resource: resource.clone(),
                metadata,
            },
        );
        inner.revision += 1;
    }

    fn remove_metadata(&self, prefix: PrefixCluster, resource: &ResourceId, _metadata: PrefixMetadata) {
        let mut inner = self.inner.write();
        Self::delete(&mut inner, &prefix, resource);
        inner.revision += 1;
    }

    fn override_identity(
        &self,
        prefix: PrefixCluster,
        labels: Labels,
        source: Source,
        resource: &ResourceId,
    ) {
        let mut inner = self.inner.write();
        inner
            .overrides
            .entry(prefix)
            .or_default()
            .insert(resource.clone(), (source, labels));
        inner.revision += 1;
    }

    fn remove_identity_override(&self, prefix: PrefixCluster, _labels: Labels, resource: &ResourceId) {
        let mut inner = self.inner.write();
        if let Some(owners) = inner.overrides.get_mut(&prefix) {
            owners.remove(resource);
            if owners.is_empty() {
                inner.overrides.remove(&prefix);
            }
        }
        inner.revision += 1;
    }

    fn upsert_metadata_batch(&self, updates: Vec<MetadataUpdate>) -> u64 {
        let mut inner = self.inner.write();
        for update in updates {
            Self::insert(&mut inner, update);
        }
        inner.revision += 1;
        inner.revision
    }

    fn remove_metadata_batch(&self, updates: Vec<MetadataUpdate>) -> u64 {
        let mut inner = self.inner.write();
        for update in updates {
            Self::delete(&mut inner, &update.prefix, &update.resource);
        }
        inner.revision += 1;
        inner.revision
    }
}
