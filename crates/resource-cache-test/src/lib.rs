//! Helpers for testing the resource cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Fetches built with [`counting_resource`] sleep on the tokio clock. Run tests with
//!    `#[tokio::test(start_paused = true)]` so that latencies and the grace window elapse
//!    instantly and deterministically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use resource_cache::config::CacheConfig;
use resource_cache::{Change, Resource, ResourceCache, ResourceFetch, StoreEvent, Subscription};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `resource_cache` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("resource_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a cache on the current runtime with the given grace window.
///
/// The sweep interval is left at its default, so it matches the grace window.
pub fn cache(release_time: Duration) -> ResourceCache {
    let config = CacheConfig {
        release_time,
        ..Default::default()
    };
    ResourceCache::new(config, Handle::current())
}

/// Counts how often a fetch has been invoked.
#[derive(Clone, Debug, Default)]
pub struct FetchCounter(Arc<AtomicUsize>);

impl FetchCounter {
    /// The number of fetch invocations so far.
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Creates a resource that resolves `f(input)` after `latency`, counting its invocations.
pub fn counting_resource<I, T, E, F>(
    name: &str,
    latency: Duration,
    f: F,
) -> (
    Resource<impl ResourceFetch<Input = I, Output = T, Error = E>>,
    FetchCounter,
)
where
    I: Serialize + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fn(I) -> Result<T, E> + Send + Sync + 'static,
{
    let counter = FetchCounter::default();
    let calls = counter.clone();
    let f = Arc::new(f);

    let resource = Resource::from_fn(name, move |input: I| {
        calls.increment();
        let f = Arc::clone(&f);
        async move {
            tokio::time::sleep(latency).await;
            f(input)
        }
    });

    (resource, counter)
}

/// Records every event emitted by a cache.
pub struct Recorder {
    events: Arc<Mutex<Vec<StoreEvent>>>,
    _subscription: Subscription,
}

impl Recorder {
    /// Subscribes to `cache`. Recording stops when the recorder is dropped.
    pub fn new(cache: &ResourceCache) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = cache.subscribe(move |event| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        });
        Self {
            events,
            _subscription: subscription,
        }
    }

    /// Returns the changes recorded so far and clears the log.
    pub fn take(&self) -> Vec<Change> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.drain(..).map(|event| event.change).collect()
    }
}
