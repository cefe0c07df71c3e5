use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Barrier;

use resource_cache::{AccessError, CacheError, Change, EntryState, StateKind};

use crate::{RELEASE_TIME, Recorder, User, cache, counting_resource, setup};

#[tokio::test(start_paused = true)]
async fn test_concurrent_access_is_deduplicated() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (resource, fetches) =
        counting_resource("double", Duration::from_millis(50), |n: u32| {
            Ok::<_, String>(n * 2)
        });

    let first = cache.access(&resource, 21).unwrap();
    let second = cache.access(&resource, 21).unwrap();

    assert_eq!(first.state(), &EntryState::Pending);
    assert_eq!(second.state(), &EntryState::Pending);
    assert!(first.future().same_entry(&second.future()));
    assert_eq!(fetches.count(), 1);
    assert_eq!(cache.entry_count(), 1);

    assert_eq!(first.future().await.unwrap(), 42);
    assert_eq!(second.future().await.unwrap(), 42);

    // settled entries are served without waiting
    let entry = cache.access(&resource, 21).unwrap();
    assert_eq!(entry.state(), &EntryState::Ok(42));
    assert_eq!(cache.get(&resource, 21).await.unwrap(), 42);
    assert_eq!(fetches.count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_access_across_threads() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (fetch_user, fetches) =
        counting_resource("fetchUser", Duration::from_millis(20), |id: u32| {
            Ok::<_, String>(User { id })
        });

    let tasks = 32;
    let barrier = Arc::new(Barrier::new(tasks));
    let mut handles = Vec::with_capacity(tasks);
    for i in 0..tasks {
        let cache = cache.clone();
        let fetch_user = fetch_user.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let future = cache.access(&fetch_user, 42).unwrap().future();
            let user = if i % 2 == 0 {
                future.clone().await.unwrap()
            } else {
                cache.get(&fetch_user, 42).await.unwrap()
            };
            (future, user)
        }));
    }

    let mut results = Vec::with_capacity(tasks);
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(fetches.count(), 1);
    assert_eq!(cache.entry_count(), 1);
    for (future, user) in &results {
        assert_eq!(user, &User { id: 42 });
        for (other, _) in &results {
            assert!(future.same_entry(other));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_fetch_user() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (fetch_user, fetches) =
        counting_resource("fetchUser", Duration::from_millis(50), |id: u32| {
            Ok::<_, String>(User { id })
        });

    let first = {
        let cache = cache.clone();
        let fetch_user = fetch_user.clone();
        tokio::spawn(async move { cache.get(&fetch_user, 42).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = cache.get(&fetch_user, 42).await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(first, User { id: 42 });
    assert_eq!(second, first);
    assert_eq!(fetches.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_structural_keys() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (search, fetches) = counting_resource("search", Duration::ZERO, |query: serde_json::Value| {
        Ok::<_, String>(query["user"].clone())
    });

    let first = cache
        .access(&search, json!({"user": 42, "tags": ["a", "b"]}))
        .unwrap();
    let second = cache
        .access(&search, json!({"tags": ["a", "b"], "user": 42.0}))
        .unwrap();
    assert!(first.future().same_entry(&second.future()));
    assert_eq!(first.key(), second.key());
    assert_eq!(fetches.count(), 1);

    // sequences are ordered
    let third = cache
        .access(&search, json!({"user": 42, "tags": ["b", "a"]}))
        .unwrap();
    assert!(!first.future().same_entry(&third.future()));
    assert_eq!(fetches.count(), 2);
    assert_eq!(cache.entry_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_map_insertion_order() {
    #[derive(Clone, Serialize)]
    struct Filter {
        fields: HashMap<String, u32>,
    }

    setup();
    let cache = cache(RELEASE_TIME);
    let (resource, fetches) = counting_resource("filter", Duration::ZERO, |filter: Filter| {
        Ok::<_, String>(filter.fields.len())
    });

    let mut forward = HashMap::new();
    let mut backward = HashMap::new();
    for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
        forward.insert(name.to_string(), i as u32);
    }
    for (i, name) in ["a", "b", "c", "d"].iter().enumerate().rev() {
        backward.insert(name.to_string(), i as u32);
    }

    let first = cache.get(&resource, Filter { fields: forward }).await;
    let second = cache.get(&resource, Filter { fields: backward }).await;
    assert_eq!(first.unwrap(), 4);
    assert_eq!(second.unwrap(), 4);
    assert_eq!(fetches.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_distinct_resources() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (users, user_fetches) = counting_resource("users", Duration::ZERO, |id: u32| {
        Ok::<_, String>(format!("user {id}"))
    });
    let (teams, team_fetches) = counting_resource("teams", Duration::ZERO, |id: u32| {
        Ok::<_, String>(format!("team {id}"))
    });

    assert_eq!(cache.get(&users, 1).await.unwrap(), "user 1");
    assert_eq!(cache.get(&teams, 1).await.unwrap(), "team 1");

    // clones share the identity of the resource
    assert_eq!(cache.get(&users.clone(), 1).await.unwrap(), "user 1");

    assert_eq!(user_fetches.count(), 1);
    assert_eq!(team_fetches.count(), 1);
    assert_eq!(cache.entry_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_state_sequence() {
    setup();
    let cache = cache(RELEASE_TIME);
    let recorder = Recorder::new(&cache);
    let (resource, _) = counting_resource("numbers", Duration::from_millis(10), |n: u32| {
        Ok::<_, String>(n)
    });

    let entry = cache.access(&resource, 7).unwrap();
    assert_eq!(entry.state(), &EntryState::Pending);
    assert_eq!(entry.refcount(), 0);
    assert_eq!(entry.released_at(), None);
    assert_eq!(recorder.take(), vec![Change::Created, Change::Pending]);

    assert_eq!(cache.get(&resource, 7).await.unwrap(), 7);
    assert_eq!(recorder.take(), vec![Change::Settled(StateKind::Ok)]);

    // reads do not change anything
    cache.get(&resource, 7).await.unwrap();
    assert_eq!(recorder.take(), vec![]);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_errors_are_cached() {
    setup();
    let cache = cache(RELEASE_TIME);
    let recorder = Recorder::new(&cache);
    let (resource, fetches) = counting_resource("failing", Duration::from_millis(10), |_: u32| {
        Err::<u32, _>("boom".to_owned())
    });

    let err = cache.get(&resource, 1).await.unwrap_err();
    assert!(matches!(err, AccessError::Fetch(ref err) if err == "boom"));
    assert_eq!(
        recorder.take(),
        vec![
            Change::Created,
            Change::Pending,
            Change::Settled(StateKind::Err)
        ]
    );

    let err = cache.get(&resource, 1).await.unwrap_err();
    assert_eq!(err.fetch_error().map(String::as_str), Some("boom"));
    assert_eq!(
        cache.access(&resource, 1).unwrap().state(),
        &EntryState::Err("boom".to_owned())
    );
    assert_eq!(fetches.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_key() {
    setup();
    let cache = cache(RELEASE_TIME);
    let (resource, fetches) = counting_resource(
        "pairs",
        Duration::ZERO,
        |pairs: HashMap<(u32, u32), u32>| Ok::<_, String>(pairs.len()),
    );

    // maps with non-string keys have no normalized form
    let err = cache
        .access(&resource, HashMap::from([((1, 2), 3)]))
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidKey(_)));
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(fetches.count(), 0);
}
