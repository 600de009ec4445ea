use crate::{MirroredObject, ObjectKey};
use std::sync::Arc;

/// Read-side access to the mirrored deployments.
///
/// Reads never reach the store. A read reflects every change applied to the mirror before it
/// began, so a value written through [`ScaleDeployments`] may not be visible until the store's
/// watch delivers it.
pub trait QueryDeployments {
    fn query_single(&self, key: &ObjectKey) -> Result<Arc<MirroredObject>, Error>;

    /// Lists keys ordered by namespace and then name. `None` lists every namespace.
    fn query_list(&self, namespace: Option<&str>) -> Vec<ObjectKey>;

    /// Indicates whether the initial sync has completed.
    fn is_ready(&self) -> bool;
}

/// Write-side access: changes are written through to the store, never to the mirror.
#[async_trait::async_trait]
pub trait ScaleDeployments {
    /// Returns the replica count that was written.
    async fn mutate(&self, key: &ObjectKey, replicas: i32) -> Result<i32, Error>;
}

/// Errors visible to API callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("deployment {0} not found")]
    NotFound(ObjectKey),

    #[error("failed to update deployment {key} scale")]
    WriteFailed {
        key: ObjectKey,
        #[source]
        source: anyhow::Error,
    },
}
