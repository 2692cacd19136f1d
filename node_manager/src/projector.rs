//! Projection of node records into the IP-cache and the node IP-sets.
//!
//! Contributions are additive across resources, so the projector never
//! clears a prefix: it upserts what a node currently implies and retracts
//! exactly what an older version implied and the new one no longer does.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::ManagerConfig;
use crate::ipcache::{IpCache, MetadataUpdate, PrefixMetadata};
use crate::ipset::{self, Family, IpSetFilter, IpSetManager};
use crate::labels::{Label, Labels, POLICY_LABEL_CLUSTER, SOURCE_K8S, SOURCE_NODE};
use crate::types::{Address, AddressType, Node, PrefixCluster, ResourceId, Source};

/// Encryption key attached to health and ingress endpoints under WireGuard.
pub const STATIC_ENCRYPT_KEY: u8 = 0x0f;

/// What one projection of a node contributed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    pub ipset_entries: Vec<IpAddr>,
    pub node_ips: Vec<PrefixCluster>,
    pub health_ips: Vec<PrefixCluster>,
    pub ingress_ips: Vec<PrefixCluster>,
    pub pod_cidrs: Vec<PrefixCluster>,
    /// `false` when a higher-priority source owns one of the prefixes and
    /// handlers should not be told about this update.
    pub datapath_update: bool,
}

impl Projection {
    /// Whether `prefix` was contributed in any role. A node holds a single
    /// contribution per prefix, so an address that doubles as a health or
    /// ingress IP stays until no role claims it.
    pub fn contributes(&self, prefix: &PrefixCluster) -> bool {
        self.node_ips.contains(prefix)
            || self.health_ips.contains(prefix)
            || self.ingress_ips.contains(prefix)
            || self.pod_cidrs.contains(prefix)
    }
}

pub struct Projector {
    config: Arc<ManagerConfig>,
    ipcache: Arc<dyn IpCache>,
    ipset: Arc<dyn IpSetManager>,
    ipset_filter: Option<IpSetFilter>,
}

impl Projector {
    pub fn new(
        config: Arc<ManagerConfig>,
        ipcache: Arc<dyn IpCache>,
        ipset: Arc<dyn IpSetManager>,
        ipset_filter: Option<IpSetFilter>,
    ) -> Self {
        Self {
            config,
            ipcache,
            ipset,
            ipset_filter,
        }
    }

    // ─── Per-node policy ──────────────────────────────────────────────────

    fn is_local(&self, node: &Node) -> bool {
        self.config.is_local(node)
    }

    /// Tunnel endpoint for traffic towards `node`; none for the local node.
    fn tunnel_ip(&self, node: &Node) -> Option<IpAddr> {
        if self.is_local(node) {
            return None;
        }
        node.node_ip(self.config.underlay_ipv6)
    }

    fn address_has_tunnel_ip(&self, address: &Address) -> bool {
        address.kind == AddressType::OverlayIp
            || self.config.enable_node_encryption
            || self.config.enable_host_firewall
    }

    fn address_encrypt_key(&self, node: &Node) -> u8 {
        if self.config.enable_node_encryption && !self.config.node_encryption_opt_out {
            node.encryption_key
        } else {
            0
        }
    }

    fn endpoint_encrypt_key(&self, node: &Node) -> u8 {
        if self.config.enable_wireguard {
            STATIC_ENCRYPT_KEY
        } else {
            node.encryption_key
        }
    }

    fn excluded_from_ipset(&self, node: &Node) -> bool {
        self.ipset_filter.as_ref().is_some_and(|f| f(node))
    }

    fn cluster_id(&self, node: &Node) -> u32 {
        if self.config.cluster_scoped_prefixes {
            node.cluster_id
        } else {
            0
        }
    }

    fn scoped_prefix(&self, node: &Node, ip: IpAddr) -> PrefixCluster {
        PrefixCluster::host(ip, self.cluster_id(node))
    }

    fn address_prefix(&self, node: &Node, address: &Address) -> PrefixCluster {
        match address.kind {
            AddressType::OverlayIp => self.scoped_prefix(node, address.ip),
            _ => PrefixCluster::host(address.ip, 0),
        }
    }

    /// Identity labels of `node`, and whether they must override the
    /// identity derived from all contributions.
    pub fn identity_labels(&self, node: &Node) -> (Labels, bool) {
        if self.is_local(node) {
            let mut labels = Labels::host();
            if self.config.policy_cidr_match_nodes {
                for address in &node.ip_addresses {
                    let enabled = match address.ip {
                        IpAddr::V4(_) => self.config.enable_ipv4,
                        IpAddr::V6(_) => self.config.enable_ipv6,
                    };
                    if enabled {
                        labels.merge(&Labels::cidr(&address.ip.into()));
                    }
                }
            }
            return (labels, false);
        }

        if node.has_allocated_identity() {
            return (Labels::from_map(&node.labels, SOURCE_K8S), true);
        }

        let mut labels = Labels::remote_node();
        if self.config.per_node_labels {
            labels.merge(&Labels::from_map(&node.labels, SOURCE_NODE));
            labels.insert(Label::new(SOURCE_K8S, POLICY_LABEL_CLUSTER, node.cluster.clone()));
        }
        (labels, false)
    }

    fn address_labels(&self, identity_labels: &Labels, prefix: &PrefixCluster) -> Labels {
        if !self.config.policy_cidr_match_nodes {
            return identity_labels.clone();
        }
        let mut labels = identity_labels.clone();
        labels.merge(&Labels::cidr(&prefix.prefix()));
        labels
    }

    fn address_metadata(&self, node: &Node, address: &Address, tunnel: Option<IpAddr>, labels: Labels) -> PrefixMetadata {
        let tunnel_peer = if self.address_has_tunnel_ip(address) {
            tunnel
        } else {
            None
        };
        PrefixMetadata::new(labels, tunnel_peer, self.address_encrypt_key(node))
    }

    /// Fallback entries for the pod CIDRs of a remote node.
    fn pod_cidr_entries(&self, node: &Node, resource: &ResourceId, tunnel: Option<IpAddr>) -> Vec<MetadataUpdate> {
        let cluster_id = self.cluster_id(node);
        let dual_stack = self.config.dual_stack();
        node.ipv4_alloc_cidrs()
            .into_iter()
            .chain(node.ipv6_alloc_cidrs())
            .map(|cidr| MetadataUpdate {
                prefix: PrefixCluster::new(cidr, cluster_id),
                source: node.source,
                resource: resource.clone(),
                metadata: PrefixMetadata::new(
                    Labels::world(&cidr, dual_stack),
                    tunnel,
                    node.encryption_key,
                ),
            })
            .collect()
    }

    /// Checks whether `node` may overwrite the current owner of `prefix`.
    /// Node addresses owned by the API server, and overlay addresses that are
    /// local router IPs, never suppress the handler notification.
    fn overwrites(&self, node: &Node, prefix: &PrefixCluster, address: Option<&Address>) -> bool {
        let existing = self.ipcache.metadata_source(prefix);
        if Source::allow_overwrite(existing, node.source) {
            return true;
        }
        let Some(address) = address else {
            return false;
        };
        existing == Source::KubeApiServer
            || (address.kind == AddressType::OverlayIp && self.config.is_local_router_ip(&address.ip))
    }

    // ─── Projection ───────────────────────────────────────────────────────

    /// Upserts everything `node` implies and returns what was contributed.
    pub fn project(&self, node: &Node) -> Projection {
        let resource = ResourceId::node(&node.name);
        let tunnel = self.tunnel_ip(node);
        let (identity_labels, identity_override) = self.identity_labels(node);
        let excluded = self.excluded_from_ipset(node);

        let mut projection = Projection {
            datapath_update: true,
            ..Default::default()
        };

        for address in &node.ip_addresses {
            let prefix = self.address_prefix(node, address);

            if address.kind == AddressType::InternalIp && !excluded {
                projection.ipset_entries.push(address.ip);
            }

            if !self.overwrites(node, &prefix, Some(address)) {
                projection.datapath_update = false;
            }

            let labels = self.address_labels(&identity_labels, &prefix);
            let metadata = self.address_metadata(node, address, tunnel, labels);
            self.ipcache.upsert_metadata(prefix, node.source, &resource, metadata);
            if identity_override {
                self.ipcache
                    .override_identity(prefix, identity_labels.clone(), node.source, &resource);
            }
            projection.node_ips.push(prefix);
        }

        let (v4, v6) = ipset::split_families(&projection.ipset_entries);
        if !v4.is_empty() {
            self.ipset.add_to_ip_set(ipset::NODE_IPSET_V4, Family::Inet, &v4);
        }
        if !v6.is_empty() {
            self.ipset.add_to_ip_set(ipset::NODE_IPSET_V6, Family::Inet6, &v6);
        }

        if !self.is_local(node) {
            let entries = self.pod_cidr_entries(node, &resource, tunnel);
            if !entries.is_empty() {
                projection.pod_cidrs = entries.iter().map(|e| e.prefix).collect();
                let revision = self.ipcache.upsert_metadata_batch(entries);
                trace!(node = %node.identity(), revision, "pod CIDR entries upserted");
            }
        }

        let endpoint_key = self.endpoint_encrypt_key(node);
        for (ips, labels, added) in [
            (node.health_ips().collect::<Vec<_>>(), Labels::health(), &mut projection.health_ips),
            (node.ingress_ips().collect::<Vec<_>>(), Labels::ingress(), &mut projection.ingress_ips),
        ] {
            for ip in ips {
                let prefix = self.scoped_prefix(node, ip);
                if !self.overwrites(node, &prefix, None) {
                    projection.datapath_update = false;
                }
                self.ipcache.upsert_metadata(
                    prefix,
                    node.source,
                    &resource,
                    PrefixMetadata::new(labels.clone(), tunnel, endpoint_key),
                );
                added.push(prefix);
            }
        }

        projection
    }

    /// Retracts everything `old` contributed that is not part of `keep`.
    /// Passing an empty projection retracts the node completely.
    pub fn retract(&self, old: &Node, keep: &Projection) {
        let resource = ResourceId::node(&old.name);
        let tunnel = self.tunnel_ip(old);
        let (identity_labels, identity_override) = self.identity_labels(old);

        let mut stale_ipset = Vec::new();
        for address in &old.ip_addresses {
            if address.kind == AddressType::InternalIp && !keep.ipset_entries.contains(&address.ip) {
                stale_ipset.push(address.ip);
            }

            let prefix = self.address_prefix(old, address);
            if keep.contributes(&prefix) {
                continue;
            }

            let labels = self.address_labels(&identity_labels, &prefix);
            let metadata = self.address_metadata(old, address, tunnel, labels);
            self.ipcache.remove_metadata(prefix, &resource, metadata);
            if identity_override {
                self.ipcache
                    .remove_identity_override(prefix, identity_labels.clone(), &resource);
            }
        }

        let (v4, v6) = ipset::split_families(&stale_ipset);
        if !v4.is_empty() {
            self.ipset.remove_from_ip_set(ipset::NODE_IPSET_V4, &v4);
        }
        if !v6.is_empty() {
            self.ipset.remove_from_ip_set(ipset::NODE_IPSET_V6, &v6);
        }

        if !self.is_local(old) {
            let stale: Vec<_> = self
                .pod_cidr_entries(old, &resource, tunnel)
                .into_iter()
                .filter(|e| !keep.contributes(&e.prefix))
                .collect();
            if !stale.is_empty() {
                self.ipcache.remove_metadata_batch(stale);
            }
        }

        let endpoint_key = self.endpoint_encrypt_key(old);
        for (ips, labels) in [
            (old.health_ips().collect::<Vec<_>>(), Labels::health()),
            (old.ingress_ips().collect::<Vec<_>>(), Labels::ingress()),
        ] {
            for ip in ips {
                let prefix = self.scoped_prefix(old, ip);
                if keep.contributes(&prefix) {
                    continue;
                }
                self.ipcache.remove_metadata(
                    prefix,
                    &resource,
                    PrefixMetadata::new(labels.clone(), tunnel, endpoint_key),
                );
            }
        }

        debug!(node = %old.identity(), "retracted stale node prefixes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockIpCache, MockIpSet};

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("valid ip")
    }

    fn host(s: &str) -> PrefixCluster {
        PrefixCluster::host(ip(s), 0)
    }

    struct Fixture {
        ipcache: Arc<MockIpCache>,
        ipset: Arc<MockIpSet>,
        projector: Projector,
    }

    fn fixture(config: ManagerConfig, filter: Option<IpSetFilter>) -> Fixture {
        let ipcache = Arc::new(MockIpCache::new());
        let ipset = Arc::new(MockIpSet::new());
        let projector = Projector::new(Arc::new(config), ipcache.clone(), ipset.clone(), filter);
        Fixture {
            ipcache,
            ipset,
            projector,
        }
    }

    fn config() -> ManagerConfig {
        ManagerConfig {
            cluster_name: "c1".into(),
            node_name: "local".into(),
            ..Default::default()
        }
    }

    fn remote() -> Node {
        let mut node = Node::new("c1", "n1", Source::Kubernetes)
            .with_address(Address::internal(ip("10.0.0.1")))
            .with_address(Address::overlay(ip("10.200.0.1")));
        node.ipv4_alloc_cidr = Some("10.1.0.0/24".parse().unwrap());
        node.ipv4_health_ip = Some(ip("10.1.0.10"));
        node.ipv4_ingress_ip = Some(ip("10.1.0.11"));
        node
    }

    #[test]
    fn project_remote_node() {
        let f = fixture(config(), None);
        let node = remote();
        let resource = ResourceId::node("n1");

        let p = f.projector.project(&node);

        assert!(p.datapath_update);
        assert_eq!(p.ipset_entries, vec![ip("10.0.0.1")]);
        assert_eq!(p.node_ips, vec![host("10.0.0.1"), host("10.200.0.1")]);
        assert_eq!(p.pod_cidrs.len(), 1);
        assert_eq!(p.health_ips, vec![host("10.1.0.10")]);
        assert_eq!(p.ingress_ips, vec![host("10.1.0.11")]);

        // Internal addresses are not tunnelled without encryption or firewall.
        let (_, internal) = f.ipcache.metadata(&host("10.0.0.1"), &resource).unwrap();
        assert_eq!(internal.tunnel_peer, None);
        assert!(internal.labels.has_reserved("remote-node"));

        let (_, overlay) = f.ipcache.metadata(&host("10.200.0.1"), &resource).unwrap();
        assert_eq!(overlay.tunnel_peer, Some(ip("10.0.0.1")));

        let pod = PrefixCluster::local("10.1.0.0/24".parse().unwrap());
        let (source, pod_meta) = f.ipcache.metadata(&pod, &resource).unwrap();
        assert_eq!(source, Source::Kubernetes);
        assert!(pod_meta.labels.has_reserved("world"));

        assert_eq!(
            f.ipset.members(ipset::NODE_IPSET_V4).into_iter().collect::<Vec<_>>(),
            vec![ip("10.0.0.1")]
        );
    }

    #[test]
    fn local_node_has_host_labels_and_no_pod_fallback() {
        let f = fixture(config(), None);
        let mut node = remote();
        node.name = "local".into();

        let p = f.projector.project(&node);

        assert!(p.pod_cidrs.is_empty());
        let (_, meta) = f
            .ipcache
            .metadata(&host("10.200.0.1"), &ResourceId::node("local"))
            .unwrap();
        assert!(meta.labels.has_reserved("host"));
        assert_eq!(meta.tunnel_peer, None);
    }

    #[test]
    fn retract_removes_only_what_was_dropped() {
        let f = fixture(config(), None);
        let resource = ResourceId::node("n1");

        let old = Node::new("c1", "n1", Source::Kubernetes)
            .with_address(Address::internal(ip("10.0.0.1")))
            .with_address(Address::internal(ip("10.0.0.2")));
        f.projector.project(&old);

        let new = Node::new("c1", "n1", Source::Kubernetes)
            .with_address(Address::internal(ip("10.0.0.2")))
            .with_address(Address::internal(ip("10.0.0.3")));
        let keep = f.projector.project(&new);
        f.projector.retract(&old, &keep);

        let prefixes: Vec<_> = f.ipcache.prefixes_of(&resource).into_iter().collect();
        assert_eq!(prefixes, vec![host("10.0.0.2"), host("10.0.0.3")]);
        assert_eq!(
            f.ipset.members(ipset::NODE_IPSET_V4).into_iter().collect::<Vec<_>>(),
            vec![ip("10.0.0.2"), ip("10.0.0.3")]
        );
    }

    #[test]
    fn moving_health_ip_off_a_node_address_keeps_the_address() {
        let f = fixture(config(), None);
        let resource = ResourceId::node("n1");

        let mut old = Node::new("c1", "n1", Source::Kubernetes)
            .with_address(Address::internal(ip("10.0.0.1")));
        old.ipv4_health_ip = Some(ip("10.0.0.1"));
        f.projector.project(&old);

        let mut new = old.clone();
        new.ipv4_health_ip = Some(ip("10.1.0.10"));
        let keep = f.projector.project(&new);
        f.projector.retract(&old, &keep);

        let prefixes: Vec<_> = f.ipcache.prefixes_of(&resource).into_iter().collect();
        assert_eq!(prefixes, vec![host("10.0.0.1"), host("10.1.0.10")]);
        assert!(f.ipcache.metadata(&host("10.0.0.1"), &resource).is_some());
    }

    #[test]
    fn dropping_an_address_keeps_it_as_health_ip() {
        let f = fixture(config(), None);
        let resource = ResourceId::node("n1");

        let old = Node::new("c1", "n1", Source::Kubernetes)
            .with_address(Address::internal(ip("10.0.0.1")))
            .with_address(Address::internal(ip("10.0.0.2")));
        f.projector.project(&old);

        let mut new = Node::new("c1", "n1", Source::Kubernetes)
            .with_address(Address::internal(ip("10.0.0.2")));
        new.ipv4_health_ip = Some(ip("10.0.0.1"));
        let keep = f.projector.project(&new);
        f.projector.retract(&old, &keep);

        let (_, meta) = f.ipcache.metadata(&host("10.0.0.1"), &resource).unwrap();
        assert!(meta.labels.has_reserved("health"));
        // Leaves the IP-set, which only tracks node addresses.
        assert_eq!(
            f.ipset.members(ipset::NODE_IPSET_V4).into_iter().collect::<Vec<_>>(),
            vec![ip("10.0.0.2")]
        );
    }

    #[test]
    fn full_retraction_leaves_other_owners_alone() {
        let f = fixture(config(), None);
        let other = ResourceId::node("other");
        f.ipcache.seed(host("10.0.0.1"), Source::Kubernetes, &other);

        let node = remote();
        f.projector.project(&node);
        f.projector.retract(&node, &Projection::default());

        assert!(f.ipcache.prefixes_of(&ResourceId::node("n1")).is_empty());
        assert_eq!(
            f.ipcache.prefixes_of(&other).into_iter().collect::<Vec<_>>(),
            vec![host("10.0.0.1")]
        );
        assert!(f.ipset.members(ipset::NODE_IPSET_V4).is_empty());
    }

    #[test]
    fn higher_priority_owner_suppresses_datapath_update() {
        let f = fixture(config(), None);
        f.ipcache
            .seed(host("10.0.0.1"), Source::KvStore, &ResourceId::node("n1-mesh"));

        let p = f.projector.project(&remote());
        assert!(!p.datapath_update);
    }

    #[test]
    fn kube_apiserver_owner_and_local_router_ip_do_not_suppress() {
        let mut cfg = config();
        cfg.local_router_ips = vec![ip("10.200.0.1")];
        let f = fixture(cfg, None);

        f.ipcache
            .seed(host("10.0.0.1"), Source::KubeApiServer, &ResourceId::node("apiserver"));
        f.ipcache
            .seed(host("10.200.0.1"), Source::Local, &ResourceId::node("router"));

        let mut node = remote();
        node.source = Source::ClusterMesh;
        assert!(f.projector.project(&node).datapath_update);
    }

    #[test]
    fn health_ip_owned_by_higher_source_suppresses_update() {
        let f = fixture(config(), None);
        f.ipcache
            .seed(host("10.1.0.10"), Source::Local, &ResourceId::node("x"));

        assert!(!f.projector.project(&remote()).datapath_update);
    }

    #[test]
    fn ipset_filter_excludes_node() {
        let filter: IpSetFilter = Arc::new(|n: &Node| n.name == "n1");
        let f = fixture(config(), Some(filter));

        let p = f.projector.project(&remote());
        assert!(p.ipset_entries.is_empty());
        assert!(f.ipset.members(ipset::NODE_IPSET_V4).is_empty());
    }

    #[test]
    fn encryption_keys_follow_config() {
        let mut cfg = config();
        cfg.enable_node_encryption = true;
        cfg.enable_wireguard = true;
        let f = fixture(cfg, None);
        let resource = ResourceId::node("n1");

        let mut node = remote();
        node.encryption_key = 3;
        f.projector.project(&node);

        let (_, internal) = f.ipcache.metadata(&host("10.0.0.1"), &resource).unwrap();
        assert_eq!(internal.encrypt_key, 3);
        assert_eq!(internal.tunnel_peer, Some(ip("10.0.0.1")));

        let (_, health) = f.ipcache.metadata(&host("10.1.0.10"), &resource).unwrap();
        assert_eq!(health.encrypt_key, STATIC_ENCRYPT_KEY);
    }

    #[test]
    fn opt_out_zeroes_address_key() {
        let mut cfg = config();
        cfg.enable_node_encryption = true;
        cfg.node_encryption_opt_out = true;
        let f = fixture(cfg, None);

        let mut node = remote();
        node.encryption_key = 3;
        f.projector.project(&node);

        let (_, internal) = f
            .ipcache
            .metadata(&host("10.0.0.1"), &ResourceId::node("n1"))
            .unwrap();
        assert_eq!(internal.encrypt_key, 0);
    }

    #[test]
    fn allocated_identity_installs_override() {
        let f = fixture(config(), None);
        let mut node = remote();
        node.node_identity = 4242;
        node.labels.insert("zone".into(), "a".into());

        f.projector.project(&node);
        let resource = ResourceId::node("n1");
        assert!(f.ipcache.has_override(&host("10.0.0.1"), &resource));

        f.projector.retract(&node, &Projection::default());
        assert!(!f.ipcache.has_override(&host("10.0.0.1"), &resource));
    }

    #[test]
    fn per_node_labels_carry_cluster_label() {
        let mut cfg = config();
        cfg.per_node_labels = true;
        let f = fixture(cfg, None);
        let mut node = remote();
        node.labels.insert("zone".into(), "a".into());

        let (labels, identity_override) = f.projector.identity_labels(&node);
        assert!(!identity_override);
        assert!(labels.has_reserved("remote-node"));
        assert!(labels.contains(&Label::new(SOURCE_NODE, "zone", "a")));
        assert!(labels.contains(&Label::new(SOURCE_K8S, POLICY_LABEL_CLUSTER, "c1")));
    }

    #[test]
    fn cidr_matching_adds_cidr_labels() {
        let mut cfg = config();
        cfg.policy_cidr_match_nodes = true;
        let f = fixture(cfg, None);

        f.projector.project(&remote());
        let (_, meta) = f
            .ipcache
            .metadata(&host("10.0.0.1"), &ResourceId::node("n1"))
            .unwrap();
        assert!(meta.labels.contains(&Label::new("cidr", "10.0.0.1/32", "")));
    }

    #[test]
    fn cluster_scoped_prefixes_only_scope_overlay_and_endpoints() {
        let mut cfg = config();
        cfg.cluster_scoped_prefixes = true;
        let f = fixture(cfg, None);
        let mut node = remote();
        node.cluster_id = 7;

        let p = f.projector.project(&node);
        assert_eq!(
            p.node_ips,
            vec![host("10.0.0.1"), PrefixCluster::host(ip("10.200.0.1"), 7)]
        );
        assert_eq!(p.health_ips, vec![PrefixCluster::host(ip("10.1.0.10"), 7)]);
        assert_eq!(p.pod_cidrs[0].cluster_id(), 7);
    }
}
