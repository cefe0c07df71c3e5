use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::CacheConfig;
use crate::entry::{AnyValue, Entry, EntryFuture, EntryState, ErasedState, downcast, erase};
use crate::error::{AccessError, CacheError};
use crate::key::CacheKey;
use crate::observers::{Change, Observers, StoreEvent, Subscription};
use crate::resource::{Resource, ResourceFetch};
use crate::store::{Slot, Store};
use crate::sweep::Sweeper;
use crate::transition::{Action, PatchFn};

/// A keyed cache of asynchronous resource fetches.
///
/// The cache is cheap to clone. All clones share the same entries.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<CacheInner>,
}

pub(crate) struct CacheInner {
    config: CacheConfig,
    runtime: Handle,
    store: Mutex<Store>,
    observers: Arc<Observers>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl CacheInner {
    fn lock_store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sweeper(&self) -> MutexGuard<'_, Option<Sweeper>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the store lock and notifies observers of the collected events afterwards.
    ///
    /// Events are queued before the lock is released, so observers see them in the order they
    /// were applied. Errors are logged before they are returned.
    fn transact<R>(
        &self,
        f: impl FnOnce(&mut Store, &mut Vec<StoreEvent>) -> Result<R, CacheError>,
    ) -> Result<R, CacheError> {
        let mut events = vec![];
        let result = {
            let mut store = self.lock_store();
            let result = f(&mut store, &mut events);
            if events.iter().any(|event| {
                matches!(
                    event.change,
                    Change::Created | Change::Evicted | Change::Abandoned
                )
            }) {
                metric!(gauge("cache.entries") = store.len() as u64);
            }
            self.observers.enqueue(&mut events);
            result
        };

        self.observers.deliver();
        if let Err(ref err) = result {
            tracing::error!(error = %err, "rejected cache operation");
        }
        result
    }

    fn dispatch(&self, action: Action<'_>) -> Result<usize, CacheError> {
        self.transact(|store, events| {
            let applied = store.apply(action)?;
            let count = applied.len();
            events.extend(applied);
            Ok(count)
        })
    }

    /// Evicts every entry that has been unclaimed for longer than the grace window.
    pub(crate) fn sweep(&self) -> usize {
        let action = Action::Sweep {
            now: Instant::now(),
            release_time: self.config.release_time,
        };
        let evicted = self.dispatch(action).unwrap_or_default();
        if evicted > 0 {
            tracing::debug!(evicted, "swept cache");
        }
        metric!(counter("cache.sweep.evicted") += evicted as i64);
        evicted
    }

    /// Settles the entry behind `channel` with the outcome of its fetch.
    ///
    /// The response is dropped if that entry has been evicted in the meantime, even if a new
    /// entry has been created for the same key. The outcome is still published to everyone
    /// waiting on the evicted entry. A response for an entry that a patch already settled is
    /// dropped as well, and the patched value stays.
    fn respond(
        &self,
        key: CacheKey,
        channel: &watch::Sender<ErasedState>,
        result: Result<AnyValue, AnyValue>,
    ) -> &'static str {
        let status = if result.is_ok() { "ok" } else { "err" };
        let state = ErasedState::from(result.clone());

        let applied = self.transact(|store, events| {
            let Some(slot) = store.get(&key).filter(|slot| owns(slot, channel)) else {
                return Ok("dropped");
            };
            if slot.state.is_settled() {
                return Ok("superseded");
            }
            events.extend(store.apply(Action::Response {
                key: key.clone(),
                result,
            })?);
            Ok(status)
        });

        match applied {
            Ok("dropped") => {
                tracing::trace!(%key, "dropping response for evicted entry");
                channel.send_replace(state);
                "dropped"
            }
            Ok("superseded") => {
                tracing::debug!(%key, "dropping response for patched entry");
                "dropped"
            }
            Ok(status) => status,
            Err(_) => "dropped",
        }
    }

    /// Removes the entry behind `channel` after its fetch panicked.
    ///
    /// Once the fetch task drops its end of the channel, everyone waiting on the entry observes
    /// [`CacheError::Abandoned`].
    fn abandon(&self, key: CacheKey, channel: &watch::Sender<ErasedState>) {
        self.transact(|store, events| {
            if store.get(&key).is_some_and(|slot| owns(slot, channel)) {
                events.extend(store.apply(Action::Abandon { key })?);
            }
            Ok(())
        })
        .ok();
    }
}

/// Whether `channel` belongs to `slot`, rather than to an evicted entry for the same key.
fn owns(slot: &Slot, channel: &watch::Sender<ErasedState>) -> bool {
    std::ptr::eq(Arc::as_ptr(&slot.channel), channel)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        let sweeper = self.sweeper.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(sweeper) = sweeper.take() {
            sweeper.cancel();
        }
    }
}

impl ResourceCache {
    /// Creates an empty cache.
    ///
    /// Fetches are spawned on `runtime`. The sweep does not run until [`start`](Self::start) is
    /// called.
    pub fn new(config: CacheConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                runtime,
                store: Mutex::default(),
                observers: Arc::default(),
                sweeper: Mutex::default(),
            }),
        }
    }

    fn cache_key<F: ResourceFetch>(
        &self,
        resource: &Resource<F>,
        input: &F::Input,
    ) -> Result<CacheKey, CacheError> {
        resource.cache_key(input).inspect_err(|err| {
            tracing::error!(error = %err, resource = resource.name(), "invalid cache key");
        })
    }

    /// Returns the entry for `input`, starting its fetch if it does not exist yet.
    ///
    /// This never waits for the fetch. Concurrent calls for the same input observe the same
    /// entry, and only the first one invokes the fetch.
    pub fn access<F: ResourceFetch>(
        &self,
        resource: &Resource<F>,
        input: F::Input,
    ) -> Result<Entry<F::Output, F::Error>, CacheError> {
        self.access_inner(resource, input, false)
    }

    fn access_inner<F: ResourceFetch>(
        &self,
        resource: &Resource<F>,
        input: F::Input,
        claim: bool,
    ) -> Result<Entry<F::Output, F::Error>, CacheError> {
        let key = self.cache_key(resource, &input)?;

        let (entry, fetch_channel) = self.inner.transact(|store, events| {
            let miss = store.get(&key).is_none();
            if miss {
                events.extend(store.apply(Action::Init {
                    key: key.clone(),
                    persist: resource.is_persistent(),
                })?);
                events.extend(store.apply(Action::Request { key: key.clone() })?);
            }
            if claim {
                events.extend(store.apply(Action::Claim { key: key.clone() })?);
            }

            let slot = store.get(&key).ok_or_else(|| CacheError::EntryMissing {
                action: "Access",
                key: key.clone(),
            })?;
            let entry: Entry<F::Output, F::Error> = slot.snapshot(&key)?;
            Ok((entry, miss.then(|| Arc::clone(&slot.channel))))
        })?;

        let result = if fetch_channel.is_some() { "miss" } else { "hit" };
        metric!(counter("cache.access") += 1, "resource" => resource.name(), "result" => result);

        match fetch_channel {
            Some(channel) => self.spawn_fetch(resource, input, key, channel),
            None => tracing::trace!(%key, state = %entry.state().kind(), "cache hit"),
        }

        Ok(entry)
    }

    fn spawn_fetch<F: ResourceFetch>(
        &self,
        resource: &Resource<F>,
        input: F::Input,
        key: CacheKey,
        channel: Arc<watch::Sender<ErasedState>>,
    ) {
        let span = tracing::debug_span!("fetch", resource = resource.name(), %key);
        let resource_name = resource.name().to_owned();
        let resource = resource.clone();
        let inner = Arc::downgrade(&self.inner);

        let task = async move {
            tracing::debug!("fetching resource");
            let start = Instant::now();
            // starting the fetch may panic as well
            let fetch = async move { resource.fetch(input).await };
            let outcome = AssertUnwindSafe(fetch).catch_unwind().await;
            metric!(timer("cache.fetch.duration") = start.elapsed(), "resource" => &resource_name);

            let result = match outcome {
                Ok(Ok(value)) => Ok(Arc::new(value) as AnyValue),
                Ok(Err(err)) => Err(Arc::new(err) as AnyValue),
                Err(panic) => {
                    tracing::error!(panic = panic_message(&*panic), "resource fetch panicked");
                    if let Some(inner) = inner.upgrade() {
                        inner.abandon(key, &channel);
                    }
                    metric!(counter("cache.fetch") += 1, "resource" => &resource_name, "status" => "panicked");
                    return;
                }
            };

            let status = match inner.upgrade() {
                Some(inner) => inner.respond(key, &channel, result),
                None => {
                    channel.send_replace(ErasedState::from(result));
                    "dropped"
                }
            };
            tracing::debug!(status, "fetch finished");
            metric!(counter("cache.fetch") += 1, "resource" => &resource_name, "status" => status);
        }
        .instrument(span)
        .bind_hub(Hub::new_from_top(Hub::current()));

        self.inner.runtime.spawn(task);
    }

    /// Reads the value for `input`, waiting for its fetch if necessary.
    ///
    /// A failed fetch is returned as [`AccessError::Fetch`]. The error stays cached, so every
    /// later read of the entry observes it too.
    pub async fn get<F: ResourceFetch>(
        &self,
        resource: &Resource<F>,
        input: F::Input,
    ) -> Result<F::Output, AccessError<F::Error>> {
        loop {
            let entry = self.access(resource, input.clone())?;
            let future = entry.future();
            match entry.into_state() {
                EntryState::Ok(value) => return Ok(value),
                EntryState::Err(err) => return Err(AccessError::Fetch(err)),
                EntryState::Init | EntryState::Pending => {
                    if let Err(err @ AccessError::Cache(_)) = future.settled().await {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Replaces the state of the entry for `input`.
    ///
    /// `update` runs under the cache lock and may move the entry into any state. If there is no
    /// entry for `input`, this fails with [`CacheError::EntryMissing`] unless `silent` is set.
    pub fn patch<F, U>(
        &self,
        resource: &Resource<F>,
        input: &F::Input,
        update: U,
        silent: bool,
    ) -> Result<(), CacheError>
    where
        F: ResourceFetch,
        U: FnOnce(EntryState<F::Output, F::Error>) -> EntryState<F::Output, F::Error>,
    {
        let key = self.cache_key(resource, input)?;
        let patch_key = key.clone();
        let update: PatchFn<'_> = Box::new(move |state: &ErasedState| {
            let state = downcast::<F::Output, F::Error>(state)
                .ok_or(CacheError::TypeMismatch { key: patch_key })?;
            Ok(Some(erase(update(state))))
        });

        self.inner.dispatch(Action::Patch {
            key,
            update,
            silent,
        })?;
        Ok(())
    }

    /// Updates the value of the entry for `input`, if its fetch succeeded.
    ///
    /// Entries in any other state are left untouched. Everyone awaiting the entry afterwards
    /// observes the updated value.
    pub fn patch_ok<F, U>(
        &self,
        resource: &Resource<F>,
        input: &F::Input,
        update: U,
        silent: bool,
    ) -> Result<(), CacheError>
    where
        F: ResourceFetch,
        U: FnOnce(F::Output) -> F::Output,
    {
        let key = self.cache_key(resource, input)?;
        let patch_key = key.clone();
        let update: PatchFn<'_> = Box::new(move |state: &ErasedState| {
            let EntryState::Ok(value) = state else {
                return Ok(None);
            };
            let value = value
                .downcast_ref::<F::Output>()
                .ok_or(CacheError::TypeMismatch { key: patch_key })?;
            let value: AnyValue = Arc::new(update(value.clone()));
            Ok(Some(EntryState::Ok(value)))
        });

        self.inner.dispatch(Action::Patch {
            key,
            update,
            silent,
        })?;
        Ok(())
    }

    /// Adds a claim to the entry for `input`, protecting it from eviction.
    pub fn claim<F: ResourceFetch>(
        &self,
        resource: &Resource<F>,
        input: &F::Input,
    ) -> Result<(), CacheError> {
        let key = self.cache_key(resource, input)?;
        self.inner.dispatch(Action::Claim { key })?;
        Ok(())
    }

    /// Removes a claim from the entry for `input`.
    ///
    /// Once the last claim is gone, the entry is evicted by the first sweep after the grace
    /// window has passed.
    pub fn release<F: ResourceFetch>(
        &self,
        resource: &Resource<F>,
        input: &F::Input,
    ) -> Result<(), CacheError> {
        let key = self.cache_key(resource, input)?;
        self.inner.dispatch(Action::Release {
            key,
            released_at: Instant::now(),
        })?;
        Ok(())
    }

    /// Accesses and claims the entry for `input` in one step.
    ///
    /// The claim is released when the returned [`Lease`] is dropped.
    pub fn lease<F: ResourceFetch>(
        &self,
        resource: &Resource<F>,
        input: F::Input,
    ) -> Result<Lease<F::Output, F::Error>, CacheError> {
        let entry = self.access_inner(resource, input, true)?;
        Ok(Lease {
            cache: Arc::downgrade(&self.inner),
            entry,
        })
    }

    /// Registers a callback that is invoked for every change to the cache.
    ///
    /// Callbacks run after the cache lock has been released, and observe changes in the order
    /// they were applied. A change may be delivered on a different thread than the one that
    /// made it.
    pub fn subscribe(
        &self,
        callback: impl Fn(&StoreEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.observers.subscribe(Arc::new(callback))
    }

    /// The number of live entries.
    pub fn entry_count(&self) -> usize {
        self.inner.lock_store().len()
    }

    /// Runs a single sweep right away, returning the number of evicted entries.
    pub fn sweep_now(&self) -> usize {
        self.inner.sweep()
    }

    /// Starts the periodic sweep.
    ///
    /// Does nothing if the sweep is already running.
    pub fn start(&self) {
        let mut sweeper = self.inner.lock_sweeper();
        if sweeper.is_some() {
            return;
        }
        let interval = self.inner.config.sweep_interval();
        tracing::debug!(?interval, "starting cache sweep");
        *sweeper = Some(Sweeper::spawn(
            Arc::downgrade(&self.inner),
            interval,
            &self.inner.runtime,
        ));
    }

    /// Stops the periodic sweep and waits for it to finish.
    pub async fn stop(&self) {
        let sweeper = self.inner.lock_sweeper().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
            tracing::debug!("stopped cache sweep");
        }
    }
}

impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("config", &self.inner.config)
            .field("entries", &self.entry_count())
            .finish_non_exhaustive()
    }
}

/// A claim on a cache entry that is released on drop.
pub struct Lease<T, E> {
    cache: Weak<CacheInner>,
    entry: Entry<T, E>,
}

impl<T, E> Lease<T, E> {
    /// The key of the claimed entry.
    pub fn key(&self) -> &CacheKey {
        self.entry.key()
    }

    /// A snapshot of the entry, taken when the lease was created.
    pub fn entry(&self) -> &Entry<T, E> {
        &self.entry
    }

    /// A handle that resolves once the entry settles.
    pub fn future(&self) -> EntryFuture<T, E> {
        self.entry.future()
    }
}

impl<T, E> Drop for Lease<T, E> {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache
                .dispatch(Action::Release {
                    key: self.entry.key().clone(),
                    released_at: Instant::now(),
                })
                .ok();
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Lease<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("entry", &self.entry).finish()
    }
}
