use crate::SharedMirror;
use deployment_scaler_core::{MirroredObject, ObjectKey};
use std::sync::Arc;
use tokio::sync::watch;

/// Supports lookups against a shared mirror.
#[derive(Clone, Debug)]
pub struct Reader {
    mirror: SharedMirror,
    synced: watch::Receiver<bool>,
}

// === impl Reader ===

impl Reader {
    pub(crate) fn new(mirror: SharedMirror, synced: watch::Receiver<bool>) -> Self {
        Self { mirror, synced }
    }

    /// Returns the latest applied state of a deployment.
    ///
    /// A missing entry may never have existed or may have been deleted; the mirror does not
    /// retain tombstones.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<MirroredObject>> {
        self.mirror.read().get(key)
    }

    /// Lists keys ordered by namespace and then name. `None` lists every namespace.
    pub fn list(&self, namespace: Option<&str>) -> Vec<ObjectKey> {
        self.mirror.read().keys(namespace)
    }

    /// Indicates whether the initial list has been applied to the mirror.
    pub fn is_ready(&self) -> bool {
        *self.synced.borrow()
    }

    /// Returns a receiver that observes the sync barrier.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.clone()
    }
}
