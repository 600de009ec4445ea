use crate::{
    core::{Error, MirroredObject, ObjectKey, ObjectStore, QueryDeployments, ScaleDeployments},
    index::Reader,
    scale::Scaler,
};
use std::sync::Arc;

/// Serves reads from the mirror and writes through the scaler.
#[derive(Clone)]
pub struct Deployments<S> {
    reader: Reader,
    scaler: Scaler<S>,
}

// === impl Deployments ===

impl<S> Deployments<S> {
    pub fn new(reader: Reader, scaler: Scaler<S>) -> Self {
        Self { reader, scaler }
    }
}

impl<S> QueryDeployments for Deployments<S> {
    fn query_single(&self, key: &ObjectKey) -> Result<Arc<MirroredObject>, Error> {
        key.validate()?;
        self.reader
            .get(key)
            .ok_or_else(|| Error::NotFound(key.clone()))
    }

    fn query_list(&self, namespace: Option<&str>) -> Vec<ObjectKey> {
        self.reader.list(namespace)
    }

    fn is_ready(&self) -> bool {
        self.reader.is_ready()
    }
}

#[async_trait::async_trait]
impl<S: ObjectStore> ScaleDeployments for Deployments<S> {
    async fn mutate(&self, key: &ObjectKey, replicas: i32) -> Result<i32, Error> {
        self.scaler.set_replicas(key, replicas).await
    }
}
