use deployment_scaler_core::{
    EventStream, ListSnapshot, MirroredObject, ObjectKey, ObjectStore, ResourceVersion,
    StoreError, WatchEvent,
};
use futures::prelude::*;
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        autoscaling::v1::{Scale, ScaleSpec},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{
    api::{Api, ListParams, PostParams, WatchParams},
    Client,
};
use tracing::{debug, warn};

/// An [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: Option<String>,
    watch_timeout_secs: u32,
}

// === impl KubeStore ===

impl KubeStore {
    /// Limits the amount of time a watch can be idle before being reset.
    ///
    /// Must be less than 295 or Kubernetes throws an error.
    pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 290;

    /// Creates a store that lists and watches deployments in all namespaces.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: None,
            watch_timeout_secs: Self::DEFAULT_WATCH_TIMEOUT_SECS,
        }
    }

    /// Restricts lists and watches to a single namespace.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs;
        self
    }

    fn api(&self) -> Api<Deployment> {
        match self.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn list(&self) -> Result<ListSnapshot, StoreError> {
        let list = self
            .api()
            .list(&ListParams::default())
            .await
            .map_err(store_error)?;
        let resource_version = list
            .metadata
            .resource_version
            .map(ResourceVersion::from)
            .unwrap_or_default();
        let objects = list.items.into_iter().filter_map(mirrored).collect();
        Ok(ListSnapshot {
            objects,
            resource_version,
        })
    }

    async fn watch(&self, from: &ResourceVersion) -> Result<EventStream, StoreError> {
        let params = WatchParams::default().timeout(self.watch_timeout_secs);
        let events = self
            .api()
            .watch(&params, from.as_str())
            .await
            .map_err(store_error)?;
        Ok(events
            .filter_map(|res| {
                future::ready(match res {
                    Ok(ev) => watch_event(ev),
                    Err(error) => Some(Err(store_error(error))),
                })
            })
            .boxed())
    }

    async fn update_scale(&self, key: &ObjectKey, replicas: i32) -> Result<(), StoreError> {
        let scale = Scale {
            metadata: ObjectMeta {
                namespace: Some(key.namespace.clone()),
                name: Some(key.name.clone()),
                ..Default::default()
            },
            spec: Some(ScaleSpec {
                replicas: Some(replicas),
            }),
            status: None,
        };
        let data = serde_json::to_vec(&scale).map_err(anyhow::Error::from)?;

        let api = Api::<Deployment>::namespaced(self.client.clone(), &key.namespace);
        api.replace_scale(&key.name, &PostParams::default(), data)
            .await
            .map_err(store_error)?;
        debug!(%key, replicas, "Replaced scale");
        Ok(())
    }
}

fn store_error(error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(ref rsp) if rsp.code == 404 => StoreError::NotFound,
        kube::Error::Api(ref rsp) if rsp.code == 409 => StoreError::Conflict(rsp.message.clone()),
        kube::Error::Api(ref rsp) if rsp.code == 410 => StoreError::VersionTooOld,
        error => StoreError::Other(error.into()),
    }
}

/// Converts a watch event, skipping objects that cannot be mirrored.
fn watch_event(
    ev: kube::core::WatchEvent<Deployment>,
) -> Option<Result<WatchEvent, StoreError>> {
    use kube::core::WatchEvent as Event;

    match ev {
        Event::Added(d) => mirrored(d).map(WatchEvent::Added).map(Ok),
        Event::Modified(d) => mirrored(d).map(WatchEvent::Modified).map(Ok),
        Event::Deleted(d) => mirrored(d).map(WatchEvent::Deleted).map(Ok),
        Event::Bookmark(bookmark) => Some(Ok(WatchEvent::Bookmark(ResourceVersion::from(
            bookmark.metadata.resource_version,
        )))),
        // The API server reports an expired resource version in-band.
        Event::Error(rsp) if rsp.code == 410 => Some(Err(StoreError::VersionTooOld)),
        Event::Error(rsp) => Some(Err(StoreError::Other(anyhow::anyhow!(
            "watch failed: {} ({})",
            rsp.message,
            rsp.code
        )))),
    }
}

fn mirrored(deployment: Deployment) -> Option<MirroredObject> {
    match MirroredObject::try_from(deployment) {
        Ok(obj) => Some(obj),
        Err(error) => {
            warn!(%error, "Skipping deployment");
            None
        }
    }
}
