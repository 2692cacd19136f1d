//! Datapath handlers subscribed to node events.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::DatapathError;
use crate::types::Node;

/// A datapath component that applies node state.
///
/// Callbacks are delivered at least once and must be idempotent. A failing
/// callback never rolls back the registry mutation that triggered it.
pub trait NodeHandler: Send + Sync {
    fn name(&self) -> &str;

    fn node_add(&self, node: &Node) -> Result<(), DatapathError>;

    fn node_update(&self, old: &Node, new: &Node) -> Result<(), DatapathError>;

    fn node_delete(&self, node: &Node) -> Result<(), DatapathError>;

    /// Re-asserts the datapath state of `node`.
    fn node_validate_implementation(&self, node: &Node) -> Result<(), DatapathError>;
}

fn same_handler(a: &Arc<dyn NodeHandler>, b: &Arc<dyn NodeHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Set of subscribed handlers, compared by pointer.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn NodeHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the handler is already subscribed.
    pub fn insert(&self, handler: Arc<dyn NodeHandler>) -> bool {
        let mut handlers = self.handlers.write();
        if handlers.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    pub fn remove(&self, handler: &Arc<dyn NodeHandler>) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        handlers.len() != before
    }

    /// Applies `f` to every handler under the read lock.
    pub fn iter(&self, mut f: impl FnMut(&dyn NodeHandler)) {
        for handler in self.handlers.read().iter() {
            f(handler.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
