use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Barrier;

use resource_cache::{AccessError, CacheError, Change, EntryState, Resource, StateKind};

use crate::{RELEASE_TIME, Recorder, cache, counting_resource, setup};

#[tokio::test(start_paused = true)]
async fn test_claim_release_misuse() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (resource, _) = counting_resource("claims", Duration::ZERO, |n: u32| Ok::<_, String>(n));

    let err = cache.claim(&resource, &1).unwrap_err();
    assert!(matches!(err, CacheError::EntryMissing { action: "Claim", .. }));
    insta::assert_snapshot!(err.to_string(), @"Claim: no entry for `claims:1`");

    let err = cache.release(&resource, &1).unwrap_err();
    assert!(matches!(err, CacheError::EntryMissing { action: "Release", .. }));

    cache.access(&resource, 1).unwrap();
    let err = cache.release(&resource, &1).unwrap_err();
    assert!(matches!(err, CacheError::NotClaimed { .. }));

    // the failed release did not touch the entry
    let entry = cache.access(&resource, 1).unwrap();
    assert_eq!(entry.refcount(), 0);
    assert_eq!(entry.released_at(), None);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_and_refetch() {
    setup();
    let cache = cache(RELEASE_TIME);
    let recorder = Recorder::new(&cache);
    let (resource, fetches) = counting_resource("numbers", Duration::from_millis(10), |n: u32| {
        Ok::<_, String>(n)
    });

    assert_eq!(cache.get(&resource, 1).await.unwrap(), 1);
    cache.claim(&resource, &1).unwrap();
    cache.release(&resource, &1).unwrap();

    // still inside the grace window
    assert_eq!(cache.sweep_now(), 0);
    assert_eq!(cache.entry_count(), 1);

    tokio::time::sleep(RELEASE_TIME).await;
    recorder.take();
    assert_eq!(cache.sweep_now(), 1);
    assert_eq!(recorder.take(), vec![Change::Evicted]);
    assert_eq!(cache.entry_count(), 0);

    // the next access starts over
    let entry = cache.access(&resource, 1).unwrap();
    assert_eq!(entry.state(), &EntryState::Pending);
    assert_eq!(entry.future().await.unwrap(), 1);
    assert_eq!(fetches.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_claimed_entries_survive_sweeps() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (resource, fetches) = counting_resource("numbers", Duration::ZERO, |n: u32| {
        Ok::<_, String>(n)
    });

    cache.get(&resource, 1).await.unwrap();
    cache.claim(&resource, &1).unwrap();
    cache.claim(&resource, &1).unwrap();
    cache.release(&resource, &1).unwrap();

    let entry = cache.access(&resource, 1).unwrap();
    assert_eq!(entry.refcount(), 1);
    assert_eq!(entry.released_at(), None);

    tokio::time::sleep(RELEASE_TIME * 10).await;
    assert_eq!(cache.sweep_now(), 0);

    // entries that were never claimed are kept as well
    cache.get(&resource, 2).await.unwrap();
    tokio::time::sleep(RELEASE_TIME * 10).await;
    assert_eq!(cache.sweep_now(), 0);

    assert_eq!(cache.entry_count(), 2);
    assert_eq!(fetches.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_entries() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (resource, fetches) = counting_resource("settings", Duration::ZERO, |n: u32| {
        Ok::<_, String>(n)
    });
    let resource = resource.persistent();
    assert!(resource.is_persistent());

    cache.get(&resource, 1).await.unwrap();
    cache.claim(&resource, &1).unwrap();
    cache.release(&resource, &1).unwrap();

    tokio::time::sleep(RELEASE_TIME * 10).await;
    assert_eq!(cache.sweep_now(), 0);
    assert_eq!(cache.get(&resource, 1).await.unwrap(), 1);
    assert_eq!(fetches.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_claim_within_grace_window() {
    setup();
    let cache = cache(RELEASE_TIME);
    cache.start();
    let (resource, fetches) = counting_resource("numbers", Duration::from_millis(10), |n: u32| {
        Ok::<_, String>(n)
    });

    cache.get(&resource, 1).await.unwrap();
    cache.claim(&resource, &1).unwrap();
    cache.release(&resource, &1).unwrap();

    tokio::time::sleep(RELEASE_TIME / 2).await;
    cache.claim(&resource, &1).unwrap();

    tokio::time::sleep(RELEASE_TIME * 5).await;
    assert_eq!(cache.entry_count(), 1);
    assert_eq!(cache.get(&resource, 1).await.unwrap(), 1);
    assert_eq!(fetches.count(), 1);

    // once released for good, the background sweep evicts the entry
    cache.release(&resource, &1).unwrap();
    tokio::time::sleep(RELEASE_TIME * 5 / 2).await;
    assert_eq!(cache.entry_count(), 0);

    cache.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_response_for_evicted_entry() {
    setup();
    let cache = cache(RELEASE_TIME);
    let recorder = Recorder::new(&cache);
    let generation = Arc::new(AtomicUsize::new(0));
    let (resource, fetches) = counting_resource("slow", Duration::from_secs(10), move |n: u32| {
        Ok::<_, String>((n, generation.fetch_add(1, Ordering::SeqCst)))
    });

    let lease = cache.lease(&resource, 1).unwrap();
    let evicted = lease.future();
    drop(lease);

    tokio::time::sleep(RELEASE_TIME).await;
    assert_eq!(cache.sweep_now(), 1);

    // a new entry for the same key, with a fetch of its own
    let fresh = cache.access(&resource, 1).unwrap();
    assert!(!fresh.future().same_entry(&evicted));
    recorder.take();

    // the first fetch finishes, the second one is still running
    tokio::time::sleep(Duration::from_secs(10) - RELEASE_TIME / 2).await;
    assert_eq!(evicted.await.unwrap(), (1, 0));
    assert_eq!(
        cache.access(&resource, 1).unwrap().state(),
        &EntryState::Pending
    );
    assert_eq!(recorder.take(), vec![]);

    assert_eq!(fresh.future().await.unwrap(), (1, 1));
    assert_eq!(recorder.take(), vec![Change::Settled(StateKind::Ok)]);
    assert_eq!(fetches.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_lease() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (resource, fetches) = counting_resource("numbers", Duration::from_millis(10), |n: u32| {
        Ok::<_, String>(n)
    });

    let first = cache.lease(&resource, 1).unwrap();
    assert_eq!(first.entry().refcount(), 1);
    assert_eq!(first.future().await.unwrap(), 1);

    let second = cache.lease(&resource, 1).unwrap();
    assert_eq!(second.entry().refcount(), 2);
    assert_eq!(second.entry().state(), &EntryState::Ok(1));
    assert_eq!(second.key(), first.key());

    drop(first);
    assert_eq!(cache.access(&resource, 1).unwrap().refcount(), 1);

    drop(second);
    let entry = cache.access(&resource, 1).unwrap();
    assert_eq!(entry.refcount(), 0);
    assert!(entry.released_at().is_some());

    tokio::time::sleep(RELEASE_TIME).await;
    assert_eq!(cache.sweep_now(), 1);
    assert_eq!(fetches.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_stop() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (resource, _) = counting_resource("numbers", Duration::ZERO, |n: u32| Ok::<_, String>(n));

    cache.start();
    // starting twice keeps the running sweep
    cache.start();

    let lease = cache.lease(&resource, 1).unwrap();
    drop(lease);
    tokio::time::sleep(RELEASE_TIME * 3).await;
    assert_eq!(cache.entry_count(), 0);

    cache.stop().await;

    let lease = cache.lease(&resource, 2).unwrap();
    drop(lease);
    tokio::time::sleep(RELEASE_TIME * 3).await;
    assert_eq!(cache.entry_count(), 1);

    assert_eq!(cache.sweep_now(), 1);
    assert_eq!(cache.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (resource, _) = counting_resource("numbers", Duration::ZERO, |n: u32| Ok::<_, String>(n));

    let seen = Arc::new(AtomicUsize::new(0));
    let subscription = {
        let seen = Arc::clone(&seen);
        cache.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    };

    cache.get(&resource, 1).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 3);

    subscription.unsubscribe();
    cache.claim(&resource, &1).unwrap();
    cache.get(&resource, 2).await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_fetch_is_abandoned() {
    setup();
    let cache = cache(RELEASE_TIME);
    let recorder = Recorder::new(&cache);
    let attempts = Arc::new(AtomicUsize::new(0));
    let (resource, fetches) = counting_resource("fragile", Duration::from_millis(10), move |n: u32| {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("fetch exploded");
        }
        Ok::<_, String>(n)
    });

    let entry = cache.access(&resource, 1).unwrap();
    let err = cache.get(&resource, 1).await.unwrap_err();
    assert!(matches!(err, AccessError::Cache(CacheError::Abandoned { .. })));
    assert!(matches!(
        entry.future().await,
        Err(AccessError::Cache(CacheError::Abandoned { .. }))
    ));
    assert_eq!(
        recorder.take(),
        vec![Change::Created, Change::Pending, Change::Abandoned]
    );
    assert_eq!(cache.entry_count(), 0);

    // the next access starts over
    assert_eq!(cache.get(&resource, 1).await.unwrap(), 1);
    assert_eq!(fetches.count(), 2);

    // a fetch that panics before returning its future
    let eager = Resource::from_fn("eager", |n: u32| {
        assert_ne!(n, 1, "no value for 1");
        async move { Ok::<_, String>(n) }
    });
    let err = cache.get(&eager, 1).await.unwrap_err();
    assert!(matches!(err, AccessError::Cache(CacheError::Abandoned { .. })));
    assert_eq!(cache.get(&eager, 2).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_events_are_delivered_in_order() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (resource, _) = counting_resource("numbers", Duration::ZERO, |n: u32| Ok::<_, String>(n));
    cache.get(&resource, 1).await.unwrap();
    let recorder = Recorder::new(&cache);

    let tasks = 16;
    let claims_per_task = 50;
    let barrier = Arc::new(Barrier::new(tasks));
    let mut handles = Vec::with_capacity(tasks);
    for _ in 0..tasks {
        let cache = cache.clone();
        let resource = resource.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            for _ in 0..claims_per_task {
                cache.claim(&resource, &1).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // every claim reports the refcount it produced, so delivery order is visible
    let refcounts: Vec<_> = recorder
        .take()
        .into_iter()
        .filter_map(|change| match change {
            Change::Claimed(refcount) => Some(refcount),
            _ => None,
        })
        .collect();
    let expected: Vec<_> = (1..=tasks * claims_per_task).collect();
    assert_eq!(refcounts, expected);
}
