use crate::{
    metrics::{Relist, SyncMetrics},
    Applied, Reader, SharedMirror,
};
use ahash::AHashSet as HashSet;
use deployment_scaler_core::{
    ListSnapshot, MirroredObject, ObjectStore, ResourceVersion, StoreError, WatchEvent,
};
use futures::prelude::*;
use tokio::{sync::watch, task::JoinHandle, time};
use tower::{
    retry::backoff::{
        Backoff, ExponentialBackoff, ExponentialBackoffMaker, InvalidBackoff, MakeBackoff,
    },
    util::rng::HasherRng,
};
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Tunes the synchronizer's timing.
#[derive(Clone, Debug)]
pub struct Params {
    /// How often the full collection is re-listed to repair missed events.
    pub resync_interval: time::Duration,

    /// Bounds the initial sync, including retries.
    pub startup_timeout: time::Duration,

    pub min_backoff: time::Duration,
    pub max_backoff: time::Duration,
}

/// Keeps a [`Mirror`](crate::Mirror) synchronized with an [`ObjectStore`].
///
/// The synchronizer lists the collection once, then follows the store's watch from the listed
/// version. Every change to the mirror, whether from a watch event or from a re-list, is applied
/// through [`Synchronizer::apply_event`] by a single task.
pub struct Synchronizer<S> {
    store: S,
    mirror: SharedMirror,
    synced: watch::Sender<bool>,

    /// The version from which a new watch resumes.
    version: ResourceVersion,

    params: Params,
    metrics: SyncMetrics,
}

/// Controls a running synchronizer.
#[derive(Debug)]
pub struct Handle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("initial sync did not complete within {0:?}")]
    Timeout(time::Duration),

    #[error("invalid backoff parameters: {0}")]
    Backoff(#[from] InvalidBackoff),
}

type Backoffs = ExponentialBackoffMaker<HasherRng>;

// === impl Params ===

impl Default for Params {
    fn default() -> Self {
        Self {
            resync_interval: time::Duration::from_secs(10 * 60),
            startup_timeout: time::Duration::from_secs(60),
            min_backoff: time::Duration::from_secs(1),
            max_backoff: time::Duration::from_secs(30),
        }
    }
}

// === impl Synchronizer ===

impl<S: ObjectStore> Synchronizer<S> {
    /// Creates a synchronizer that populates `mirror`, which is expected to be empty.
    pub fn new(
        store: S,
        mirror: SharedMirror,
        params: Params,
        metrics: SyncMetrics,
    ) -> (Self, Reader) {
        let (synced, synced_rx) = watch::channel(false);
        let reader = Reader::new(mirror.clone(), synced_rx);
        let sync = Self {
            store,
            mirror,
            synced,
            version: ResourceVersion::default(),
            params,
            metrics,
        };
        (sync, reader)
    }

    /// Lists the collection into the mirror and then spawns a task that follows the watch.
    ///
    /// Returns once the mirror holds the initial list, i.e. once the sync barrier is satisfied.
    /// List failures are retried until the startup timeout elapses.
    pub async fn start(mut self) -> Result<Handle, SyncError> {
        let mut backoffs = ExponentialBackoffMaker::new(
            self.params.min_backoff,
            self.params.max_backoff,
            0.0,
            HasherRng::new(),
        )?;

        let timeout = self.params.startup_timeout;
        let mut backoff = backoffs.make_backoff();
        if time::timeout(timeout, self.initial_sync(&mut backoff))
            .await
            .is_err()
        {
            return Err(SyncError::Timeout(timeout));
        }

        self.synced.send_replace(true);
        info!(
            deployments = self.mirror.read().len(),
            version = %self.version,
            "Initial sync complete"
        );

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(backoffs, stop_rx).instrument(info_span!("watch")));
        Ok(Handle { stop, task })
    }

    /// Applies a single change to the mirror.
    ///
    /// Added and modified objects replace the stored entry unless the stored entry has a newer
    /// version. Deletions always remove the entry.
    pub fn apply_event(&self, ev: WatchEvent) {
        match ev {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let key = obj.key.clone();
                let version = obj.resource_version.clone();
                let applied = self.mirror.write().apply(obj);
                match applied {
                    Applied::Stale => {
                        self.metrics.stale_event();
                        debug!(%key, %version, "Ignoring stale event");
                    }
                    applied => trace!(%key, %version, ?applied),
                }
            }
            WatchEvent::Deleted(obj) => {
                if self.mirror.write().delete(&obj.key).is_some() {
                    trace!(key = %obj.key, "Deleted");
                }
            }
            WatchEvent::Bookmark(_) => {}
        }
    }

    /// Lists the collection and reconciles the mirror against it.
    ///
    /// On success, subsequent watches resume from the listed version.
    pub async fn resync(&mut self) -> Result<(), StoreError> {
        self.relist(Relist::Resync).await
    }

    async fn initial_sync(&mut self, backoff: &mut ExponentialBackoff) {
        loop {
            match self.relist(Relist::Initial).await {
                Ok(()) => return,
                Err(error) => {
                    warn!(%error, "Failed to list deployments");
                    backoff.next_backoff().await;
                }
            }
        }
    }

    async fn relist(&mut self, reason: Relist) -> Result<(), StoreError> {
        let ListSnapshot {
            objects,
            resource_version,
        } = self.store.list().await?;
        self.metrics.relist(reason);
        debug!(?reason, deployments = objects.len(), version = %resource_version, "Listed");
        self.reconcile(objects, &resource_version);
        self.version = resource_version;
        Ok(())
    }

    /// Removes entries that are absent from a list taken at `version` and applies every listed
    /// object.
    fn reconcile(&self, objects: Vec<MirroredObject>, version: &ResourceVersion) {
        let listed = objects
            .iter()
            .map(|obj| obj.key.clone())
            .collect::<HashSet<_>>();

        // Entries newer than the list were observed after it was taken and are retained.
        let removed = self
            .mirror
            .read()
            .objects()
            .filter(|obj| {
                !listed.contains(&obj.key) && !version.is_older_than(&obj.resource_version)
            })
            .map(|obj| MirroredObject::clone(obj))
            .collect::<Vec<_>>();

        for obj in removed {
            self.apply_event(WatchEvent::Deleted(obj));
        }
        for obj in objects {
            self.apply_event(WatchEvent::Added(obj));
        }
    }

    async fn run(mut self, backoffs: Backoffs, mut stop: watch::Receiver<bool>) {
        tokio::select! {
            biased;
            _ = stop.changed() => {}
            () = self.follow(backoffs) => {}
        }
        debug!("Stopped");
    }

    /// Follows the store's watch indefinitely, re-subscribing and re-listing as needed.
    ///
    /// A subscription that stays open for at least the minimum backoff, or that delivers an
    /// event, is healthy: when it ends the watch restarts immediately and the backoff is reset.
    async fn follow(&mut self, mut backoffs: Backoffs) {
        let mut backoff = backoffs.make_backoff();
        let interval = self.params.resync_interval;
        let mut resync = time::interval_at(time::Instant::now() + interval, interval);
        resync.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            let mut events = match self.store.watch(&self.version).await {
                Ok(events) => events,
                Err(StoreError::VersionTooOld) => {
                    info!(version = %self.version, "Watch version expired");
                    self.relist_until_ok(Relist::Expired, &mut backoff).await;
                    backoff = backoffs.make_backoff();
                    continue;
                }
                Err(error) => {
                    warn!(%error, version = %self.version, "Failed to watch deployments");
                    self.metrics.watch_restart();
                    backoff.next_backoff().await;
                    continue;
                }
            };
            debug!(version = %self.version, "Watching");

            let opened = time::Instant::now();
            let mut received = false;
            loop {
                tokio::select! {
                    ev = events.next() => match ev {
                        Some(Ok(ev)) => {
                            if !received {
                                received = true;
                                backoff = backoffs.make_backoff();
                            }
                            self.metrics.event(&ev);
                            let version = ev.resource_version().clone();
                            self.apply_event(ev);
                            if !version.is_older_than(&self.version) {
                                self.version = version;
                            }
                        }
                        Some(Err(StoreError::VersionTooOld)) => {
                            info!(version = %self.version, "Watch version expired");
                            self.relist_until_ok(Relist::Expired, &mut backoff).await;
                            backoff = backoffs.make_backoff();
                            break;
                        }
                        Some(Err(error)) => {
                            warn!(%error, version = %self.version, "Watch failed");
                            self.metrics.watch_restart();
                            backoff.next_backoff().await;
                            break;
                        }
                        None => {
                            debug!(version = %self.version, "Watch ended");
                            self.metrics.watch_restart();
                            if received || opened.elapsed() >= self.params.min_backoff {
                                backoff = backoffs.make_backoff();
                            } else {
                                backoff.next_backoff().await;
                            }
                            break;
                        }
                    },

                    _ = resync.tick() => match self.relist(Relist::Resync).await {
                        // Events from the old subscription may predate the list, so the watch
                        // restarts from the listed version.
                        Ok(()) => break,
                        Err(error) => warn!(%error, "Failed to resync deployments"),
                    },
                }
            }
        }
    }

    async fn relist_until_ok(&mut self, reason: Relist, backoff: &mut ExponentialBackoff) {
        loop {
            match self.relist(reason).await {
                Ok(()) => return,
                Err(error) => {
                    warn!(%error, "Failed to list deployments");
                    backoff.next_backoff().await;
                }
            }
        }
    }
}

// === impl Handle ===

impl Handle {
    /// Signals the synchronizer to stop. Calling this more than once has no further effect.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stops the synchronizer and waits for its task to complete.
    pub async fn stopped(self) {
        self.stop();
        if let Err(error) = self.task.await {
            warn!(%error, "Synchronizer task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
