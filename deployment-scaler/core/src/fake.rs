//! An in-memory [`ObjectStore`] for tests.
//!
//! The fake keeps an authoritative set of deployments and a store-wide version counter. Changes
//! made through [`FakeStore::upsert`] and [`FakeStore::remove`] are delivered to open watches
//! immediately, while scale updates are queued until [`FakeStore::deliver_pending`] is called so
//! that tests can observe the window between a write and its watch event.

use crate::{
    Deployment, EventStream, ListSnapshot, MirroredObject, ObjectKey, ObjectStore,
    ResourceVersion, StoreError, WatchEvent,
};
use k8s_openapi::{api::apps::v1::DeploymentSpec, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;

type WatchTx = mpsc::UnboundedSender<Result<WatchEvent, StoreError>>;

#[derive(Clone, Default)]
pub struct FakeStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, MirroredObject>,
    version: u64,
    watches: Vec<WatchTx>,
    pending: Vec<WatchEvent>,

    list_failures: VecDeque<StoreError>,
    watch_failures: VecDeque<StoreError>,
    scale_failures: VecDeque<StoreError>,
    scale_latency: Option<Duration>,

    list_calls: usize,
    watch_calls: Vec<ResourceVersion>,
    scale_calls: Vec<(ObjectKey, i32)>,
}

pub fn mk_deployment(ns: &str, name: &str, replicas: i32, version: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            resource_version: Some(version.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn mk_object(ns: &str, name: &str, replicas: i32, version: &str) -> MirroredObject {
    MirroredObject::try_from(mk_deployment(ns, name, replicas, version))
        .expect("fake deployment must be valid")
}

// === impl FakeStore ===

impl FakeStore {
    /// Creates or replaces a deployment at the next store version and notifies watches.
    pub fn upsert(&self, ns: &str, name: &str, replicas: i32) -> MirroredObject {
        let mut inner = self.inner.lock();
        let existed = inner.objects.contains_key(&ObjectKey::new(ns, name));
        let obj = inner.upsert(ns, name, replicas);
        let ev = if existed {
            WatchEvent::Modified(obj.clone())
        } else {
            WatchEvent::Added(obj.clone())
        };
        inner.notify(Ok(ev));
        obj
    }

    /// Deletes a deployment and notifies watches.
    pub fn remove(&self, ns: &str, name: &str) -> Option<MirroredObject> {
        let mut inner = self.inner.lock();
        let deleted = inner.remove(ns, name)?;
        inner.notify(Ok(WatchEvent::Deleted(deleted.clone())));
        Some(deleted)
    }

    /// Creates or replaces a deployment without notifying watches, as if the event were lost.
    pub fn upsert_quietly(&self, ns: &str, name: &str, replicas: i32) {
        self.inner.lock().upsert(ns, name, replicas);
    }

    /// Deletes a deployment without notifying watches, as if the event were lost.
    pub fn remove_quietly(&self, ns: &str, name: &str) {
        self.inner.lock().remove(ns, name);
    }

    /// Sends an arbitrary event to all open watches without touching the authoritative set.
    pub fn send(&self, ev: WatchEvent) {
        self.inner.lock().notify(Ok(ev));
    }

    /// Sends an error to all open watches.
    pub fn fail_watches(&self, error: StoreError) {
        self.inner.lock().notify(Err(error));
    }

    /// Ends all open watch streams.
    pub fn close_watches(&self) {
        self.inner.lock().watches.clear();
    }

    /// Delivers the watch events produced by scale updates.
    pub fn deliver_pending(&self) {
        let mut inner = self.inner.lock();
        for ev in std::mem::take(&mut inner.pending) {
            inner.notify(Ok(ev));
        }
    }

    pub fn fail_next_list(&self, error: StoreError) {
        self.inner.lock().list_failures.push_back(error);
    }

    pub fn fail_next_watch(&self, error: StoreError) {
        self.inner.lock().watch_failures.push_back(error);
    }

    pub fn fail_next_scale(&self, error: StoreError) {
        self.inner.lock().scale_failures.push_back(error);
    }

    pub fn set_scale_latency(&self, latency: Duration) {
        self.inner.lock().scale_latency = Some(latency);
    }

    pub fn get(&self, ns: &str, name: &str) -> Option<MirroredObject> {
        self.inner.lock().objects.get(&ObjectKey::new(ns, name)).cloned()
    }

    pub fn version(&self) -> ResourceVersion {
        ResourceVersion::from(self.inner.lock().version.to_string())
    }

    pub fn list_calls(&self) -> usize {
        self.inner.lock().list_calls
    }

    pub fn watch_calls(&self) -> Vec<ResourceVersion> {
        self.inner.lock().watch_calls.clone()
    }

    pub fn scale_calls(&self) -> Vec<(ObjectKey, i32)> {
        self.inner.lock().scale_calls.clone()
    }

    pub fn open_watches(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watches.retain(|tx| !tx.is_closed());
        inner.watches.len()
    }
}

#[async_trait::async_trait]
impl ObjectStore for FakeStore {
    async fn list(&self) -> Result<ListSnapshot, StoreError> {
        let mut inner = self.inner.lock();
        inner.list_calls += 1;
        if let Some(error) = inner.list_failures.pop_front() {
            return Err(error);
        }
        Ok(ListSnapshot {
            objects: inner.objects.values().cloned().collect(),
            resource_version: ResourceVersion::from(inner.version.to_string()),
        })
    }

    async fn watch(&self, from: &ResourceVersion) -> Result<EventStream, StoreError> {
        let mut inner = self.inner.lock();
        inner.watch_calls.push(from.clone());
        if let Some(error) = inner.watch_failures.pop_front() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.watches.push(tx);
        Ok(Box::pin(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ))
    }

    async fn update_scale(&self, key: &ObjectKey, replicas: i32) -> Result<(), StoreError> {
        let latency = {
            let mut inner = self.inner.lock();
            inner.scale_calls.push((key.clone(), replicas));
            inner.scale_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock();
        if let Some(error) = inner.scale_failures.pop_front() {
            return Err(error);
        }
        if !inner.objects.contains_key(key) {
            return Err(StoreError::NotFound);
        }
        let obj = inner.upsert(&key.namespace, &key.name, replicas);
        inner.pending.push(WatchEvent::Modified(obj));
        Ok(())
    }
}

// === impl Inner ===

impl Inner {
    fn upsert(&mut self, ns: &str, name: &str, replicas: i32) -> MirroredObject {
        let obj = self.bump(ns, name, replicas);
        self.objects.insert(obj.key.clone(), obj.clone());
        obj
    }

    fn remove(&mut self, ns: &str, name: &str) -> Option<MirroredObject> {
        let obj = self.objects.remove(&ObjectKey::new(ns, name))?;
        self.version += 1;
        Some(MirroredObject {
            resource_version: ResourceVersion::from(self.version.to_string()),
            ..obj
        })
    }

    fn bump(&mut self, ns: &str, name: &str, replicas: i32) -> MirroredObject {
        self.version += 1;
        mk_object(ns, name, replicas, &self.version.to_string())
    }

    fn notify(&mut self, ev: Result<WatchEvent, StoreError>) {
        match ev {
            Ok(ev) => self.watches.retain(|tx| tx.send(Ok(ev.clone())).is_ok()),
            Err(error) => {
                // Errors are not `Clone`, so only the first live watch receives one.
                let mut error = Some(error);
                self.watches.retain(|tx| match error.take() {
                    Some(e) => tx.send(Err(e)).is_ok(),
                    None => !tx.is_closed(),
                });
            }
        }
    }
}
