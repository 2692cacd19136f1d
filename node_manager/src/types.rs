//! Node records and the keys derived from them.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

// ─── Source ────────────────────────────────────────────────────────────────

/// Provenance of a node record or of a fact derived from it.
///
/// Variants are declared from the lowest to the highest priority, so the
/// derived `Ord` is the overwrite precedence.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Source {
    #[default]
    #[serde(rename = "unspec")]
    Unspec,
    /// Read back from the on-disk checkpoint, never confirmed live.
    #[serde(rename = "restored")]
    Restored,
    #[serde(rename = "generated")]
    Generated,
    #[serde(rename = "api")]
    LocalApi,
    #[serde(rename = "directory")]
    Directory,
    #[serde(rename = "clustermesh")]
    ClusterMesh,
    /// Cluster API discovery.
    #[serde(rename = "k8s")]
    Kubernetes,
    #[serde(rename = "custom-resource")]
    CustomResource,
    /// Multi-cluster store.
    #[serde(rename = "kvstore")]
    KvStore,
    /// Discovered by the local agent itself.
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "kube-apiserver")]
    KubeApiServer,
}

impl Source {
    /// Every source, lowest priority first.
    pub const ALL: [Source; 11] = [
        Source::Unspec,
        Source::Restored,
        Source::Generated,
        Source::LocalApi,
        Source::Directory,
        Source::ClusterMesh,
        Source::Kubernetes,
        Source::CustomResource,
        Source::KvStore,
        Source::Local,
        Source::KubeApiServer,
    ];

    /// Whether a fact written by `new` may replace one written by `existing`.
    pub fn allow_overwrite(existing: Source, new: Source) -> bool {
        new >= existing
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Unspec => "unspec",
            Source::Restored => "restored",
            Source::Generated => "generated",
            Source::LocalApi => "api",
            Source::Directory => "directory",
            Source::ClusterMesh => "clustermesh",
            Source::Kubernetes => "k8s",
            Source::CustomResource => "custom-resource",
            Source::KvStore => "kvstore",
            Source::Local => "local",
            Source::KubeApiServer => "kube-apiserver",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Identity ──────────────────────────────────────────────────────────────

/// Fleet-wide unique key of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub cluster: String,
    pub name: String,
}

impl Identity {
    pub fn new(cluster: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.name)
    }
}

// ─── Addresses ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    #[serde(rename = "InternalIP")]
    InternalIp,
    #[serde(rename = "ExternalIP")]
    ExternalIp,
    /// Address of the node on the overlay network.
    #[serde(rename = "OverlayIP")]
    OverlayIp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    #[serde(rename = "type")]
    pub kind: AddressType,
    pub ip: IpAddr,
}

impl Address {
    pub fn new(kind: AddressType, ip: IpAddr) -> Self {
        Self { kind, ip }
    }

    pub fn internal(ip: IpAddr) -> Self {
        Self::new(AddressType::InternalIp, ip)
    }

    pub fn external(ip: IpAddr) -> Self {
        Self::new(AddressType::ExternalIp, ip)
    }

    pub fn overlay(ip: IpAddr) -> Self {
        Self::new(AddressType::OverlayIp, ip)
    }
}

// ─── Node ──────────────────────────────────────────────────────────────────

/// Numeric identities below this value are reserved.
pub const MIN_ALLOCATED_IDENTITY: u32 = 256;

/// A member of the fleet as reported by one of the sources.
///
/// This is also the on-disk checkpoint record, so field names are part of the
/// checkpoint format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Node {
    pub name: String,
    pub cluster: String,
    /// Numeric id of `cluster`, used to scope prefixes when enabled.
    pub cluster_id: u32,
    pub ip_addresses: Vec<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_alloc_cidr: Option<IpNet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_alloc_cidr: Option<IpNet>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ipv4_secondary_alloc_cidrs: Vec<IpNet>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ipv6_secondary_alloc_cidrs: Vec<IpNet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_health_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_health_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_ingress_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_ingress_ip: Option<IpAddr>,
    pub encryption_key: u8,
    /// Numeric security identity allocated for the node, if any.
    pub node_identity: u32,
    pub labels: BTreeMap<String, String>,
    pub source: Source,
}

impl Node {
    pub fn new(cluster: impl Into<String>, name: impl Into<String>, source: Source) -> Self {
        Self {
            cluster: cluster.into(),
            name: name.into(),
            source,
            ..Default::default()
        }
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.cluster.clone(), self.name.clone())
    }

    /// Primary address of the requested family: the first internal address,
    /// falling back to the first external one.
    pub fn node_ip(&self, ipv6: bool) -> Option<IpAddr> {
        let of_family = |kind: AddressType| {
            self.ip_addresses
                .iter()
                .find(|a| a.kind == kind && a.ip.is_ipv6() == ipv6)
                .map(|a| a.ip)
        };
        of_family(AddressType::InternalIp).or_else(|| of_family(AddressType::ExternalIp))
    }

    pub fn ipv4_alloc_cidrs(&self) -> Vec<IpNet> {
        self.ipv4_alloc_cidr
            .iter()
            .chain(self.ipv4_secondary_alloc_cidrs.iter())
            .copied()
            .collect()
    }

    pub fn ipv6_alloc_cidrs(&self) -> Vec<IpNet> {
        self.ipv6_alloc_cidr
            .iter()
            .chain(self.ipv6_secondary_alloc_cidrs.iter())
            .copied()
            .collect()
    }

    pub fn health_ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ipv4_health_ip.into_iter().chain(self.ipv6_health_ip)
    }

    pub fn ingress_ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ipv4_ingress_ip.into_iter().chain(self.ipv6_ingress_ip)
    }

    /// Whether the node carries an allocated, non-reserved security identity.
    pub fn has_allocated_identity(&self) -> bool {
        self.node_identity >= MIN_ALLOCATED_IDENTITY
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.ip_addresses.push(address);
        self
    }
}

// ─── IP-cache keys ─────────────────────────────────────────────────────────

/// A prefix scoped to a cluster. `cluster_id == 0` is the local scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrefixCluster {
    prefix: IpNet,
    cluster_id: u32,
}

impl PrefixCluster {
    pub fn new(prefix: IpNet, cluster_id: u32) -> Self {
        Self {
            prefix: prefix.trunc(),
            cluster_id,
        }
    }

    pub fn local(prefix: IpNet) -> Self {
        Self::new(prefix, 0)
    }

    /// Host prefix (/32 or /128) for a single address.
    pub fn host(ip: IpAddr, cluster_id: u32) -> Self {
        Self::new(IpNet::from(ip), cluster_id)
    }

    pub fn prefix(&self) -> IpNet {
        self.prefix
    }

    pub fn cluster_id(&self) -> u32 {
        self.cluster_id
    }
}

impl fmt::Display for PrefixCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cluster_id == 0 {
            write!(f, "{}", self.prefix)
        } else {
            write!(f, "{}@{}", self.prefix, self.cluster_id)
        }
    }
}

/// Owner tag attached to every IP-cache contribution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn node(name: &str) -> Self {
        Self(format!("node//{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("valid ip")
    }

    #[test]
    fn source_precedence_follows_declaration_order() {
        assert!(Source::allow_overwrite(Source::Kubernetes, Source::KvStore));
        assert!(Source::allow_overwrite(Source::Kubernetes, Source::Kubernetes));
        assert!(!Source::allow_overwrite(Source::KvStore, Source::Kubernetes));
        assert!(!Source::allow_overwrite(Source::Kubernetes, Source::Restored));
        assert!(Source::allow_overwrite(Source::Restored, Source::ClusterMesh));
        assert!(Source::allow_overwrite(Source::Local, Source::KubeApiServer));
    }

    #[test]
    fn all_sources_are_indexed_by_discriminant() {
        for (i, source) in Source::ALL.iter().enumerate() {
            assert_eq!(*source as usize, i);
        }
        assert!(Source::ALL.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn source_serializes_to_short_names() {
        assert_eq!(serde_json::to_string(&Source::Kubernetes).unwrap(), "\"k8s\"");
        assert_eq!(
            serde_json::from_str::<Source>("\"kvstore\"").unwrap(),
            Source::KvStore
        );
        assert_eq!(Source::Restored.to_string(), "restored");
    }

    #[test]
    fn node_ip_prefers_internal_then_external() {
        let node = Node::new("c1", "n1", Source::Kubernetes)
            .with_address(Address::external(ip("192.0.2.10")))
            .with_address(Address::internal(ip("10.0.0.1")))
            .with_address(Address::external(ip("2001:db8::1")));

        assert_eq!(node.node_ip(false), Some(ip("10.0.0.1")));
        assert_eq!(node.node_ip(true), Some(ip("2001:db8::1")));

        let bare = Node::new("c1", "n2", Source::Kubernetes);
        assert_eq!(bare.node_ip(false), None);
    }

    #[test]
    fn alloc_cidrs_include_secondaries() {
        let mut node = Node::new("c1", "n1", Source::Kubernetes);
        node.ipv4_alloc_cidr = Some("10.1.0.0/24".parse().unwrap());
        node.ipv4_secondary_alloc_cidrs = vec!["10.2.0.0/24".parse().unwrap()];

        assert_eq!(node.ipv4_alloc_cidrs().len(), 2);
        assert!(node.ipv6_alloc_cidrs().is_empty());
    }

    #[test]
    fn node_json_uses_camel_case_and_tolerates_missing_fields() {
        let json = r#"{
            "name": "n1",
            "cluster": "c1",
            "ipAddresses": [{"type": "InternalIP", "ip": "10.0.0.1"}],
            "ipv4HealthIp": "10.0.0.100",
            "source": "k8s"
        }"#;

        let node: Node = serde_json::from_str(json).expect("node should deserialize");
        assert_eq!(node.identity(), Identity::new("c1", "n1"));
        assert_eq!(node.ip_addresses, vec![Address::internal(ip("10.0.0.1"))]);
        assert_eq!(node.ipv4_health_ip, Some(ip("10.0.0.100")));
        assert_eq!(node.encryption_key, 0);
        assert_eq!(node.source, Source::Kubernetes);
    }

    #[test]
    fn prefix_cluster_truncates_and_displays_scope() {
        let p = PrefixCluster::new("10.1.2.3/16".parse().unwrap(), 7);
        assert_eq!(p.prefix().to_string(), "10.1.0.0/16");
        assert_eq!(p.to_string(), "10.1.0.0/16@7");

        let host = PrefixCluster::host(ip("10.0.0.1"), 0);
        assert_eq!(host.to_string(), "10.0.0.1/32");
    }
}
