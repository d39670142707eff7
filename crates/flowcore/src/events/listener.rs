use crate::{FlowNode, RunId};
use std::sync::{Arc, PoisonError, RwLock};

/// Observer of flow graph growth.
///
/// Called synchronously for every appended node, before the engine
/// creates that node's successor. Listeners only ever see shared
/// references.
pub trait GraphListener: Send + Sync {
    fn on_new_head(&self, run_id: RunId, node: &FlowNode);
}

/// Process-lifetime set of graph listeners, populated at startup.
#[derive(Default)]
pub struct GraphListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn GraphListener>>>,
}

impl GraphListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn GraphListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Deliver to every listener in registration order.
    pub fn notify(&self, run_id: RunId, node: &FlowNode) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_new_head(run_id, node);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
