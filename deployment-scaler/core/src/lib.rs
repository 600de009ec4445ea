#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod deployments;
#[cfg(feature = "test-util")]
pub mod fake;
mod object;
mod store;

pub use self::{
    deployments::{Error, QueryDeployments, ScaleDeployments},
    object::{InvalidObject, MirroredObject, ResourceVersion, DEFAULT_REPLICAS},
    store::{EventStream, ListSnapshot, ObjectStore, StoreError, WatchEvent},
};
pub use k8s_openapi::api::apps::v1::Deployment;
use std::fmt;

/// Identifies a deployment by its namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

// === impl ObjectKey ===

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Fails if either half of the key is empty.
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() || self.name.is_empty() {
            return Err(Error::InvalidInput(
                "Both namespace and deployment must be specified".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
