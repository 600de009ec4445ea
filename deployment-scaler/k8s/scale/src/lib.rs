//! Writes replica counts through to the object store.
//!
//! The [`Scaler`] never touches the mirror. A successful write becomes visible to readers only
//! once the store's watch delivers the corresponding event.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;


pub use self::metrics::ScaleMetrics;
use self::metrics::Outcome;
use deployment_scaler_core::{Error, ObjectKey, ObjectStore, StoreError};
use tokio::time;
use tracing::{debug, info, warn};

/// The default bound on a single scale write.
pub const DEFAULT_TIMEOUT: time::Duration = time::Duration::from_secs(10);

#[derive(Clone)]
pub struct Scaler<S> {
    store: S,
    timeout: time::Duration,
    metrics: ScaleMetrics,
}

// === impl Scaler ===

impl<S: ObjectStore> Scaler<S> {
    pub fn new(store: S, timeout: time::Duration, metrics: ScaleMetrics) -> Self {
        Self {
            store,
            timeout,
            metrics,
        }
    }

    /// Sets the desired replica count of a deployment.
    ///
    /// The write is not retried: a conflict or any other store failure is reported as
    /// [`Error::WriteFailed`]. Dropping the returned future abandons the in-flight write.
    pub async fn set_replicas(&self, key: &ObjectKey, replicas: i32) -> Result<i32, Error> {
        let start = time::Instant::now();
        let res = self.write(key, replicas).await;
        self.metrics.observe(Outcome::of(&res), start.elapsed());
        res
    }

    async fn write(&self, key: &ObjectKey, replicas: i32) -> Result<i32, Error> {
        key.validate()?;
        if replicas < 0 {
            return Err(Error::InvalidInput(
                "Replica count must be non-negative".to_string(),
            ));
        }

        debug!(%key, replicas, "Updating scale");
        match time::timeout(self.timeout, self.store.update_scale(key, replicas)).await {
            Ok(Ok(())) => {
                info!(%key, replicas, "Updated scale");
                Ok(replicas)
            }
            Ok(Err(StoreError::NotFound)) => {
                debug!(%key, "Deployment not found");
                Err(Error::NotFound(key.clone()))
            }
            Ok(Err(error)) => {
                warn!(%key, %error, "Failed to update scale");
                Err(Error::WriteFailed {
                    key: key.clone(),
                    source: error.into(),
                })
            }
            Err(_) => {
                warn!(%key, timeout = ?self.timeout, "Scale update timed out");
                Err(Error::WriteFailed {
                    key: key.clone(),
                    source: anyhow::anyhow!("scale update timed out after {:?}", self.timeout),
                })
            }
        }
    }
}
