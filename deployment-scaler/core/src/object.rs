use crate::ObjectKey;
use k8s_openapi::api::apps::v1::Deployment;
use std::{fmt, sync::Arc};

/// The replica count the API server assigns when a deployment omits one.
pub const DEFAULT_REPLICAS: i32 = 1;

/// An opaque version token assigned by the object store.
///
/// Kubernetes resource versions are documented as opaque, but in practice they are the backing
/// store's revision counter. Versions that parse as integers are ordered numerically; any other
/// version cannot be ordered and is never considered older than another.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceVersion(String);

/// A snapshot of a deployment as last observed from the store.
#[derive(Clone, Debug, PartialEq)]
pub struct MirroredObject {
    pub key: ObjectKey,
    pub replicas: i32,
    pub resource_version: ResourceVersion,

    /// The full object, passed through unmodified.
    pub deployment: Arc<Deployment>,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidObject {
    #[error("object has no namespace")]
    MissingNamespace,

    #[error("object has no name")]
    MissingName,

    #[error("object {0} has no resource version")]
    MissingResourceVersion(ObjectKey),
}

// === impl ResourceVersion ===

impl ResourceVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true only if both versions are ordered and `self` precedes `other`.
    pub fn is_older_than(&self, other: &Self) -> bool {
        match (self.ordinal(), other.ordinal()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    fn ordinal(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl Default for ResourceVersion {
    fn default() -> Self {
        Self::from("0")
    }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

impl From<String> for ResourceVersion {
    fn from(v: String) -> Self {
        Self(v)
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl MirroredObject ===

impl TryFrom<Deployment> for MirroredObject {
    type Error = InvalidObject;

    fn try_from(deployment: Deployment) -> Result<Self, Self::Error> {
        let meta = &deployment.metadata;
        let namespace = meta
            .namespace
            .clone()
            .ok_or(InvalidObject::MissingNamespace)?;
        let name = meta.name.clone().ok_or(InvalidObject::MissingName)?;
        let key = ObjectKey { namespace, name };
        let resource_version = match meta.resource_version.clone() {
            Some(v) => ResourceVersion(v),
            None => return Err(InvalidObject::MissingResourceVersion(key)),
        };
        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(DEFAULT_REPLICAS);

        Ok(Self {
            key,
            replicas,
            resource_version,
            deployment: Arc::new(deployment),
        })
    }
}
