//! The IP-cache seen from the node manager.
//!
//! The IP-cache maps prefixes to forwarding metadata. Several resources may
//! contribute to the same prefix; each call adds or removes exactly one
//! resource's contribution, and removal of an absent contribution is a no-op.

use std::net::IpAddr;

use crate::labels::Labels;
use crate::types::{PrefixCluster, ResourceId, Source};

/// Metadata one resource attaches to a prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixMetadata {
    pub labels: Labels,
    /// Tunnel endpoint traffic to the prefix is encapsulated towards.
    pub tunnel_peer: Option<IpAddr>,
    /// Encryption key index, `0` when traffic is not encrypted.
    pub encrypt_key: u8,
}

impl PrefixMetadata {
    pub fn new(labels: Labels, tunnel_peer: Option<IpAddr>, encrypt_key: u8) -> Self {
        Self {
            labels,
            tunnel_peer,
            encrypt_key,
        }
    }
}

/// One entry of a batched metadata call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataUpdate {
    pub prefix: PrefixCluster,
    pub source: Source,
    pub resource: ResourceId,
    pub metadata: PrefixMetadata,
}

pub trait IpCache: Send + Sync {
    /// Highest-priority source currently contributing to `prefix`, or
    /// [`Source::Unspec`] when nothing does.
    fn metadata_source(&self, prefix: &PrefixCluster) -> Source;

    fn upsert_metadata(
        &self,
        prefix: PrefixCluster,
        source: Source,
        resource: &ResourceId,
        metadata: PrefixMetadata,
    );

    fn remove_metadata(&self, prefix: PrefixCluster, resource: &ResourceId, metadata: PrefixMetadata);

    /// Forces the identity of `prefix` to be derived from `labels` only.
    fn override_identity(
        &self,
        prefix: PrefixCluster,
        labels: Labels,
        source: Source,
        resource: &ResourceId,
    );

    fn remove_identity_override(&self, prefix: PrefixCluster, labels: Labels, resource: &ResourceId);

    /// Returns the revision at which the batch is applied.
    fn upsert_metadata_batch(&self, updates: Vec<MetadataUpdate>) -> u64;

    fn remove_metadata_batch(&self, updates: Vec<MetadataUpdate>) -> u64;
}
