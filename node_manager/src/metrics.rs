//! Node manager counters.
//!
//! Lock-free: every field is an atomic, so recording never contends with the
//! registry locks. `to_prometheus` renders the text exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Source;

const NAMESPACE: &str = "fleetnode";

/// Kind of node event received by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Add, EventKind::Update, EventKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "add",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

#[derive(Debug)]
pub struct NodeMetrics {
    /// Indexed by event kind, then by source discriminant.
    events_received: [[AtomicU64; Source::ALL.len()]; EventKind::ALL.len()],
    num_nodes: AtomicU64,
    datapath_validations: AtomicU64,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            events_received: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
            num_nodes: AtomicU64::new(0),
            datapath_validations: AtomicU64::new(0),
        }
    }

    pub fn record_event(&self, kind: EventKind, source: Source) {
        self.events_received[kind as usize][source as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn node_added(&self) {
        self.num_nodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn node_removed(&self) {
        let _ = self
            .num_nodes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn record_validation(&self) {
        self.datapath_validations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_received(&self, kind: EventKind, source: Source) -> u64 {
        self.events_received[kind as usize][source as usize].load(Ordering::SeqCst)
    }

    pub fn num_nodes(&self) -> u64 {
        self.num_nodes.load(Ordering::SeqCst)
    }

    pub fn datapath_validations(&self) -> u64 {
        self.datapath_validations.load(Ordering::SeqCst)
    }

    /// Prometheus text exposition. Label pairs that never saw an event are
    /// omitted.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let events = format!("{NAMESPACE}_nodes_all_events_received_total");
        let _ = writeln!(out, "# HELP {events} Number of node events received");
        let _ = writeln!(out, "# TYPE {events} counter");
        for kind in EventKind::ALL {
            for source in Source::ALL {
                let count = self.events_received(kind, source);
                if count > 0 {
                    let _ = writeln!(
                        out,
                        "{events}{{event_type=\"{}\",source=\"{}\"}} {count}",
                        kind.as_str(),
                        source.as_str()
                    );
                }
            }
        }

        let nodes = format!("{NAMESPACE}_nodes_all_num");
        let _ = writeln!(out, "# HELP {nodes} Number of nodes managed");
        let _ = writeln!(out, "# TYPE {nodes} gauge");
        let _ = writeln!(out, "{nodes} {}", self.num_nodes());

        let validations = format!("{NAMESPACE}_nodes_all_datapath_validations_total");
        let _ = writeln!(out, "# HELP {validations} Number of validation calls to implement the datapath implementation of a node");
        let _ = writeln!(out, "# TYPE {validations} counter");
        let _ = writeln!(out, "{validations} {}", self.datapath_validations());
        out
    }
}
