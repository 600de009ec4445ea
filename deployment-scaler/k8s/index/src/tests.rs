use super::*;
use deployment_scaler_core::{
    fake::{mk_object, FakeStore},
    ObjectKey, ResourceVersion, StoreError, WatchEvent,
};
use maplit::btreeset;
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::collections::BTreeSet;
use tokio::time;

fn params() -> Params {
    Params {
        resync_interval: time::Duration::from_secs(600),
        startup_timeout: time::Duration::from_secs(5),
        min_backoff: time::Duration::from_millis(10),
        max_backoff: time::Duration::from_millis(100),
    }
}

fn synchronizer(store: FakeStore) -> (Synchronizer<FakeStore>, Reader) {
    Synchronizer::new(
        store,
        SharedMirror::default(),
        params(),
        SyncMetrics::default(),
    )
}

async fn start(store: &FakeStore) -> (Handle, Reader) {
    let (sync, reader) = synchronizer(store.clone());
    let handle = time::timeout(time::Duration::from_secs(10), sync.start())
        .await
        .expect("start must not hang")
        .expect("initial sync must succeed");
    (handle, reader)
}

/// Waits for a condition that is satisfied asynchronously by the synchronizer task.
async fn until(mut f: impl FnMut() -> bool) {
    time::timeout(time::Duration::from_secs(10), async {
        while !f() {
            time::sleep(time::Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition must be satisfied");
}

fn replicas(reader: &Reader, ns: &str, name: &str) -> Option<i32> {
    reader
        .get(&ObjectKey::new(ns, name))
        .map(|obj| obj.replicas)
}

#[tokio::test]
async fn barrier_exposes_initial_list() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    store.upsert("default", "api", 2);
    store.upsert("kube-system", "dns", 1);

    let (sync, reader) = synchronizer(store.clone());
    assert!(!reader.is_ready());
    assert!(reader.list(None).is_empty());

    let handle = sync.start().await.expect("initial sync must succeed");
    assert!(reader.is_ready());
    assert!(*reader.synced().borrow());
    assert_eq!(
        reader.list(None).into_iter().collect::<BTreeSet<_>>(),
        btreeset! {
            ObjectKey::new("default", "api"),
            ObjectKey::new("default", "web"),
            ObjectKey::new("kube-system", "dns"),
        }
    );
    assert_eq!(replicas(&reader, "default", "web"), Some(3));

    // The watch resumes from the version reported by the list.
    until(|| store.open_watches() == 1).await;
    assert_eq!(store.watch_calls(), vec![store.version()]);

    handle.stopped().await;
}

#[tokio::test]
async fn applies_watch_events() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    let (handle, reader) = start(&store).await;
    until(|| store.open_watches() == 1).await;

    store.upsert("default", "api", 1);
    store.upsert("default", "web", 4);
    until(|| replicas(&reader, "default", "web") == Some(4)).await;
    assert_eq!(replicas(&reader, "default", "api"), Some(1));

    store.remove("default", "api");
    until(|| replicas(&reader, "default", "api").is_none()).await;
    assert_eq!(reader.list(Some("default")), vec![ObjectKey::new("default", "web")]);

    handle.stopped().await;
}

#[tokio::test]
async fn deleted_key_is_visible_until_delete_is_applied() {
    let store = FakeStore::default();
    let obj = store.upsert("default", "web", 3);
    let (sync, reader) = synchronizer(store);

    sync.apply_event(WatchEvent::Added(obj.clone()));
    assert_eq!(replicas(&reader, "default", "web"), Some(3));

    sync.apply_event(WatchEvent::Deleted(obj));
    assert!(reader.get(&ObjectKey::new("default", "web")).is_none());
    assert!(reader.list(None).is_empty());
}

#[tokio::test]
async fn reapplying_an_event_is_idempotent() {
    let (sync, reader) = synchronizer(FakeStore::default());
    let key = ObjectKey::new("default", "web");
    let obj = mk_object("default", "web", 3, "7");

    sync.apply_event(WatchEvent::Added(obj.clone()));
    let first = reader.get(&key).expect("object must be mirrored");

    sync.apply_event(WatchEvent::Added(obj));
    let second = reader.get(&key).expect("object must be mirrored");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(reader.list(None), vec![key]);
}

#[tokio::test]
async fn stale_events_are_ignored() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    let (handle, reader) = start(&store).await;
    until(|| store.open_watches() == 1).await;

    store.send(WatchEvent::Modified(mk_object("default", "web", 9, "0")));
    // Events are applied in order, so once a later event is visible the stale one was handled.
    store.upsert("default", "other", 1);
    until(|| replicas(&reader, "default", "other") == Some(1)).await;
    assert_eq!(replicas(&reader, "default", "web"), Some(3));

    handle.stopped().await;
}

/// Applies every ordering of a set of versioned updates to a single key and checks that the
/// stored version never regresses and that the final state does not depend on the order.
#[tokio::test]
async fn apply_order_does_not_affect_final_state() {
    let updates = (1..=4)
        .map(|v| mk_object("default", "web", v * 10, &v.to_string()))
        .collect::<Vec<_>>();
    let key = ObjectKey::new("default", "web");

    let mut orderings = Vec::new();
    permutations(&mut (0..updates.len()).collect(), 0, &mut orderings);
    assert_eq!(orderings.len(), 24);

    for order in orderings {
        let (sync, reader) = synchronizer(FakeStore::default());
        let mut last = None::<u64>;
        for i in order.iter().copied() {
            sync.apply_event(WatchEvent::Modified(updates[i].clone()));
            let stored = reader.get(&key).expect("object must be mirrored");
            let version = stored
                .resource_version
                .as_str()
                .parse::<u64>()
                .expect("versions are numeric");
            if let Some(last) = last {
                assert!(version >= last, "version regressed in {order:?}");
            }
            last = Some(version);
        }

        let stored = reader.get(&key).expect("object must be mirrored");
        assert_eq!(*stored, updates[3], "unexpected final state for {order:?}");
    }
}

fn permutations(items: &mut Vec<usize>, k: usize, out: &mut Vec<Vec<usize>>) {
    if k == items.len() {
        out.push(items.clone());
        return;
    }
    for i in k..items.len() {
        items.swap(k, i);
        permutations(items, k + 1, out);
        items.swap(k, i);
    }
}

#[tokio::test]
async fn resubscribes_from_last_version_after_watch_error() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    let (handle, reader) = start(&store).await;
    until(|| store.open_watches() == 1).await;

    let api = store.upsert("default", "api", 1);
    until(|| replicas(&reader, "default", "api").is_some()).await;

    store.fail_watches(StoreError::Other(anyhow::anyhow!("connection reset")));
    until(|| store.watch_calls().len() == 2).await;
    assert_eq!(store.watch_calls()[1], api.resource_version);
    assert_eq!(store.list_calls(), 1, "a transient error must not relist");

    // The new subscription continues to deliver changes.
    until(|| store.open_watches() == 1).await;
    store.upsert("default", "web", 5);
    until(|| replicas(&reader, "default", "web") == Some(5)).await;

    handle.stopped().await;
}

#[tokio::test]
async fn relists_when_version_is_too_old() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    store.upsert("default", "api", 1);
    let (handle, reader) = start(&store).await;
    until(|| store.open_watches() == 1).await;

    // Changes that the mirror never hears about.
    store.upsert_quietly("default", "web", 6);
    store.remove_quietly("default", "api");
    store.upsert_quietly("default", "db", 2);

    store.fail_watches(StoreError::VersionTooOld);
    until(|| store.list_calls() == 2).await;
    until(|| store.open_watches() == 1).await;

    assert_eq!(replicas(&reader, "default", "web"), Some(6));
    assert_eq!(
        reader.list(None),
        vec![ObjectKey::new("default", "db"), ObjectKey::new("default", "web")]
    );
    assert_eq!(store.watch_calls().last(), Some(&store.version()));

    handle.stopped().await;
}

#[tokio::test]
async fn relists_when_watch_cannot_start_from_version() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    store.fail_next_watch(StoreError::VersionTooOld);
    let (handle, _reader) = start(&store).await;

    until(|| store.open_watches() == 1).await;
    assert_eq!(store.list_calls(), 2);
    assert_eq!(store.watch_calls().len(), 2);

    handle.stopped().await;
}

#[tokio::test]
async fn bookmarks_advance_the_resume_version() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    let (handle, reader) = start(&store).await;
    until(|| store.open_watches() == 1).await;

    store.send(WatchEvent::Bookmark(ResourceVersion::from("100")));
    store.close_watches();
    until(|| store.watch_calls().len() == 2).await;

    assert_eq!(store.watch_calls()[1], ResourceVersion::from("100"));
    assert_eq!(reader.list(None), vec![ObjectKey::new("default", "web")]);
    assert_eq!(store.list_calls(), 1);

    handle.stopped().await;
}

#[tokio::test(start_paused = true)]
async fn periodic_resync_repairs_drift() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    store.upsert("default", "api", 1);
    let (handle, reader) = start(&store).await;
    until(|| store.open_watches() == 1).await;

    store.remove_quietly("default", "api");
    store.upsert_quietly("default", "web", 4);

    time::sleep(params().resync_interval + time::Duration::from_secs(1)).await;
    until(|| store.list_calls() == 2).await;
    until(|| replicas(&reader, "default", "web") == Some(4)).await;
    assert_eq!(reader.list(None), vec![ObjectKey::new("default", "web")]);

    // The watch restarts from the listed version.
    until(|| store.watch_calls().len() == 2).await;
    assert_eq!(store.watch_calls()[1], store.version());

    handle.stopped().await;
}

#[tokio::test]
async fn resync_reconciles_against_the_store() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    let (mut sync, reader) = synchronizer(store.clone());
    sync.resync().await.expect("list must succeed");
    assert_eq!(reader.list(None), vec![ObjectKey::new("default", "web")]);

    store.remove_quietly("default", "web");
    store.upsert_quietly("default", "api", 2);
    sync.resync().await.expect("list must succeed");
    assert_eq!(reader.list(None), vec![ObjectKey::new("default", "api")]);
    assert_eq!(replicas(&reader, "default", "api"), Some(2));

    store.fail_next_list(StoreError::Other(anyhow::anyhow!("unavailable")));
    assert!(sync.resync().await.is_err());
    assert_eq!(reader.list(None), vec![ObjectKey::new("default", "api")]);
}

#[tokio::test(start_paused = true)]
async fn startup_retries_list_failures() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    store.fail_next_list(StoreError::Other(anyhow::anyhow!("unavailable")));
    store.fail_next_list(StoreError::Other(anyhow::anyhow!("unavailable")));

    let (handle, reader) = start(&store).await;
    assert_eq!(store.list_calls(), 3);
    assert_eq!(replicas(&reader, "default", "web"), Some(3));

    handle.stopped().await;
}

#[tokio::test(start_paused = true)]
async fn startup_fails_when_list_never_succeeds() {
    let store = FakeStore::default();
    for _ in 0..1_000 {
        store.fail_next_list(StoreError::Other(anyhow::anyhow!("unavailable")));
    }

    let (sync, reader) = synchronizer(store.clone());
    match sync.start().await {
        Err(SyncError::Timeout(timeout)) => assert_eq!(timeout, params().startup_timeout),
        Ok(_) => panic!("initial sync must not succeed"),
        Err(error) => panic!("unexpected error: {error}"),
    }
    assert!(!reader.is_ready());
    assert!(store.list_calls() > 1, "list failures must be retried");
}

#[tokio::test]
async fn stop_is_idempotent() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    let (handle, reader) = start(&store).await;
    until(|| store.open_watches() == 1).await;

    handle.stop();
    handle.stop();
    until(|| handle.is_finished()).await;
    time::timeout(time::Duration::from_secs(1), handle.stopped())
        .await
        .expect("stopped synchronizer must complete");

    // The subscription is released and later changes are not applied.
    assert_eq!(store.open_watches(), 0);
    store.upsert("default", "web", 8);
    assert_eq!(replicas(&reader, "default", "web"), Some(3));
    assert!(reader.is_ready());
}

#[tokio::test(start_paused = true)]
async fn quiet_watches_reconnect_without_backoff() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    let (handle, _reader) = start(&store).await;
    until(|| store.open_watches() == 1).await;

    // Each subscription ends normally after a period without events.
    for calls in 2..=8 {
        time::sleep(params().min_backoff * 2).await;
        store.close_watches();
        let closed = time::Instant::now();
        until(|| store.watch_calls().len() == calls).await;
        assert!(
            closed.elapsed() < params().min_backoff,
            "reconnect {calls} waited {:?}",
            closed.elapsed()
        );
        until(|| store.open_watches() == 1).await;
    }
    assert_eq!(store.list_calls(), 1);

    handle.stopped().await;
}

#[tokio::test(start_paused = true)]
async fn watches_that_close_immediately_back_off() {
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    let (handle, _reader) = start(&store).await;
    until(|| store.open_watches() == 1).await;

    let mut gaps = Vec::new();
    for calls in 2..=4 {
        store.close_watches();
        let closed = time::Instant::now();
        until(|| store.watch_calls().len() == calls).await;
        gaps.push(closed.elapsed());
        until(|| store.open_watches() == 1).await;
    }

    assert!(gaps[0] >= params().min_backoff, "{gaps:?}");
    assert!(gaps[2] >= params().min_backoff * 4, "{gaps:?}");

    handle.stopped().await;
}

#[tokio::test]
async fn relists_are_not_counted_as_watch_events() {
    let mut registry = Registry::default();
    let metrics = SyncMetrics::register(&mut registry);
    let store = FakeStore::default();
    store.upsert("default", "web", 3);
    store.upsert("default", "api", 1);

    let (sync, reader) =
        Synchronizer::new(store.clone(), SharedMirror::default(), params(), metrics);
    let handle = sync.start().await.expect("initial sync must succeed");
    until(|| store.open_watches() == 1).await;

    store.upsert("default", "db", 2);
    until(|| replicas(&reader, "default", "db").is_some()).await;

    let mut text = String::new();
    encode(&mut text, &registry).expect("metrics must encode");
    assert!(text.contains(r#"events_total{kind="added"} 1"#), "{text}");
    assert!(text.contains(r#"relists_total{reason="initial"} 1"#), "{text}");

    handle.stopped().await;
}
