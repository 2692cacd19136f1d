//! The node registry.
//!
//! Two lock levels: the registry lock guards which identities exist, each
//! entry's mutex guards the node record. Locks are always taken registry
//! first, and the entry lock is acquired before the registry lock is
//! released so that two writers of the same identity cannot interleave.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::types::{Identity, Node, Source};

/// Exclusive access to one registry entry, outliving the registry lock.
pub type EntryGuard = ArcMutexGuard<RawMutex, Node>;

type Entry = Arc<Mutex<Node>>;

pub enum Upsert {
    /// The identity was unknown; the guard holds the new record.
    Inserted(EntryGuard),
    /// The record was replaced; `old` is the previous record.
    Updated { old: Node, guard: EntryGuard },
    /// The stored record is owned by a source with higher priority.
    Rejected { owner: Source },
}

pub enum Removal {
    /// The entry was removed; the guard holds the removed record until the
    /// caller is done notifying handlers.
    Removed(EntryGuard),
    Missing,
    Rejected { owner: Source },
}

#[derive(Default)]
pub struct NodeStore {
    nodes: RwLock<HashMap<Identity, Entry>>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record for `node.identity()` if the node's
    /// source may overwrite the stored one. The arbitration check and the
    /// replacement happen under the entry lock.
    pub fn upsert(&self, node: Node) -> Upsert {
        let identity = node.identity();

        {
            let nodes = self.nodes.read();
            if let Some(entry) = nodes.get(&identity) {
                let guard = entry.lock_arc();
                drop(nodes);
                return Self::replace(guard, node);
            }
        }

        let mut nodes = self.nodes.write();
        // Another writer may have inserted the identity between the two locks.
        if let Some(entry) = nodes.get(&identity) {
            let guard = entry.lock_arc();
            drop(nodes);
            return Self::replace(guard, node);
        }

        let entry = Arc::new(Mutex::new(node));
        let guard = entry.lock_arc();
        nodes.insert(identity, entry);
        drop(nodes);
        Upsert::Inserted(guard)
    }

    fn replace(mut guard: EntryGuard, node: Node) -> Upsert {
        if !Source::allow_overwrite(guard.source, node.source) {
            return Upsert::Rejected {
                owner: guard.source,
            };
        }
        let old = std::mem::replace(&mut *guard, node);
        Upsert::Updated { old, guard }
    }

    /// Removes the entry for `identity` if `source` may overwrite its owner.
    pub fn remove(&self, identity: &Identity, source: Source) -> Removal {
        self.remove_if(identity, |owner| Source::allow_overwrite(owner, source))
    }

    /// Removes the entry for `identity` if `allow` accepts its owner. The
    /// check runs under the entry lock.
    pub fn remove_if(&self, identity: &Identity, allow: impl FnOnce(Source) -> bool) -> Removal {
        let mut nodes = self.nodes.write();
        let Some(entry) = nodes.get(identity) else {
            return Removal::Missing;
        };
        let guard = entry.lock_arc();
        if !allow(guard.source) {
            return Removal::Rejected {
                owner: guard.source,
            };
        }
        nodes.remove(identity);
        drop(nodes);
        Removal::Removed(guard)
    }

    /// Locks a single entry, or `None` if the identity is unknown.
    pub fn lock_entry(&self, identity: &Identity) -> Option<EntryGuard> {
        let nodes = self.nodes.read();
        let guard = nodes.get(identity)?.lock_arc();
        drop(nodes);
        Some(guard)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.nodes.read().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time list of identities; no lock is held once it returns.
    pub fn identities(&self) -> Vec<Identity> {
        self.nodes.read().keys().cloned().collect()
    }

    /// Point-in-time copy of every record, locking entries one at a time.
    pub fn snapshot(&self) -> HashMap<Identity, Node> {
        let nodes = self.nodes.read();
        nodes
            .iter()
            .map(|(id, entry)| (id.clone(), entry.lock().clone()))
            .collect()
    }

    /// Copy of every record, sorted by identity.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.snapshot().into_values().collect();
        nodes.sort_by_key(|a| a.identity());
        nodes
    }

    /// Calls `f` for every record while holding the registry read lock and
    /// that record's entry lock.
    pub fn for_each(&self, mut f: impl FnMut(&Node)) {
        let nodes = self.nodes.read();
        for entry in nodes.values() {
            f(&entry.lock());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, source: Source) -> Node {
        Node::new("c1", name, source)
    }

    #[test]
    fn upsert_inserts_then_updates() {
        let store = NodeStore::new();

        assert!(matches!(
            store.upsert(node("n1", Source::Kubernetes)),
            Upsert::Inserted(_)
        ));

        let mut changed = node("n1", Source::Kubernetes);
        changed.encryption_key = 3;
        match store.upsert(changed) {
            Upsert::Updated { old, guard } => {
                assert_eq!(old.encryption_key, 0);
                assert_eq!(guard.encryption_key, 3);
            }
            _ => panic!("expected update"),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn lower_source_is_rejected() {
        let store = NodeStore::new();
        drop(store.upsert(node("n1", Source::KvStore)));

        match store.upsert(node("n1", Source::Kubernetes)) {
            Upsert::Rejected { owner } => assert_eq!(owner, Source::KvStore),
            _ => panic!("expected rejection"),
        }
        assert_eq!(
            store.snapshot()[&Identity::new("c1", "n1")].source,
            Source::KvStore
        );
    }

    #[test]
    fn remove_checks_owner() {
        let store = NodeStore::new();
        let id = Identity::new("c1", "n1");
        drop(store.upsert(node("n1", Source::KvStore)));

        assert!(matches!(
            store.remove(&id, Source::Kubernetes),
            Removal::Rejected {
                owner: Source::KvStore
            }
        ));
        assert!(store.contains(&id));

        assert!(matches!(store.remove(&id, Source::KvStore), Removal::Removed(_)));
        assert!(!store.contains(&id));
        assert!(matches!(store.remove(&id, Source::KvStore), Removal::Missing));
    }

    #[test]
    fn remove_if_sees_the_owner() {
        let store = NodeStore::new();
        let id = Identity::new("c1", "n1");
        drop(store.upsert(node("n1", Source::ClusterMesh)));

        assert!(matches!(
            store.remove_if(&id, |owner| owner == Source::Kubernetes),
            Removal::Rejected {
                owner: Source::ClusterMesh
            }
        ));
        assert!(store.contains(&id));
        assert!(matches!(
            store.remove_if(&id, |owner| owner == Source::ClusterMesh),
            Removal::Removed(_)
        ));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let store = NodeStore::new();
        drop(store.upsert(node("n1", Source::Kubernetes)));
        drop(store.upsert(node("n2", Source::Kubernetes)));

        let mut snapshot = store.snapshot();
        snapshot.clear();

        assert_eq!(store.len(), 2);
        let names: Vec<_> = store.nodes().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["n1", "n2"]);
    }

    #[test]
    fn held_entry_does_not_block_other_identities() {
        let store = Arc::new(NodeStore::new());
        drop(store.upsert(node("n1", Source::Kubernetes)));

        let _held = store
            .lock_entry(&Identity::new("c1", "n1"))
            .expect("entry exists");

        let other = store.clone();
        let handle = std::thread::spawn(move || {
            matches!(other.upsert(node("n2", Source::Kubernetes)), Upsert::Inserted(_))
        });
        assert!(handle.join().unwrap());
        assert_eq!(store.identities().len(), 2);
    }
}
