use crate::{MirroredObject, ObjectKey, ResourceVersion};
use futures::prelude::*;
use std::pin::Pin;

/// A change observed on a watch subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    Added(MirroredObject),
    Modified(MirroredObject),
    Deleted(MirroredObject),

    /// Advances the resume point of the subscription without describing a change.
    Bookmark(ResourceVersion),
}

/// The result of a full list: every object and the store version at which the list was taken.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListSnapshot {
    pub objects: Vec<MirroredObject>,
    pub resource_version: ResourceVersion,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, StoreError>> + Send + 'static>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested watch starting point has been compacted away; a full list is required.
    #[error("resource version too old")]
    VersionTooOld,

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The authoritative store of deployments.
#[async_trait::async_trait]
pub trait ObjectStore: Clone + Send + Sync + 'static {
    async fn list(&self) -> Result<ListSnapshot, StoreError>;

    /// Opens a subscription that delivers changes after `from`.
    ///
    /// A stream that ends normally (e.g. on a server-side timeout) may be resumed from the last
    /// version it delivered.
    async fn watch(&self, from: &ResourceVersion) -> Result<EventStream, StoreError>;

    /// Sets the desired replica count through the store's scale subresource.
    async fn update_scale(&self, key: &ObjectKey, replicas: i32) -> Result<(), StoreError>;
}

// === impl WatchEvent ===

impl WatchEvent {
    pub fn resource_version(&self) -> &ResourceVersion {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => &obj.resource_version,
            Self::Bookmark(version) => version,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified(_) => "modified",
            Self::Deleted(_) => "deleted",
            Self::Bookmark(_) => "bookmark",
        }
    }
}
