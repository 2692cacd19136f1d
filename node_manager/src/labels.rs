//! Security labels attached to IP-cache prefixes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

pub const SOURCE_RESERVED: &str = "reserved";
pub const SOURCE_CIDR: &str = "cidr";
pub const SOURCE_K8S: &str = "k8s";
pub const SOURCE_NODE: &str = "node";

/// Label carrying the cluster name of a remote node.
pub const POLICY_LABEL_CLUSTER: &str = "io.fleetnode.policy.cluster";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub source: String,
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(source: &str, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn reserved(key: &str) -> Self {
        Self::new(SOURCE_RESERVED, key, "")
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}:{}", self.source, self.key)
        } else {
            write!(f, "{}:{}={}", self.source, self.key, self.value)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Labels(BTreeSet<Label>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_label(label: Label) -> Self {
        Self(BTreeSet::from([label]))
    }

    pub fn host() -> Self {
        Self::from_label(Label::reserved("host"))
    }

    pub fn remote_node() -> Self {
        Self::from_label(Label::reserved("remote-node"))
    }

    pub fn health() -> Self {
        Self::from_label(Label::reserved("health"))
    }

    pub fn ingress() -> Self {
        Self::from_label(Label::reserved("ingress"))
    }

    /// Labels resolving to the world identity for `prefix`. In dual-stack
    /// mode the world identity is split per family.
    pub fn world(prefix: &IpNet, dual_stack: bool) -> Self {
        let key = match (dual_stack, prefix) {
            (false, _) => "world",
            (true, IpNet::V4(_)) => "world-ipv4",
            (true, IpNet::V6(_)) => "world-ipv6",
        };
        Self::from_label(Label::reserved(key))
    }

    pub fn cidr(prefix: &IpNet) -> Self {
        Self::from_label(Label::new(SOURCE_CIDR, prefix.trunc().to_string(), ""))
    }

    /// Converts a plain key/value map into labels of the given source.
    pub fn from_map(map: &BTreeMap<String, String>, source: &str) -> Self {
        Self(
            map.iter()
                .map(|(k, v)| Label::new(source, k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn insert(&mut self, label: Label) {
        self.0.insert(label);
    }

    pub fn merge(&mut self, other: &Labels) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.0.contains(label)
    }

    pub fn has_reserved(&self, key: &str) -> bool {
        self.0
            .iter()
            .any(|l| l.source == SOURCE_RESERVED && l.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for label in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{label}")?;
            first = false;
        }
        Ok(())
    }
}
