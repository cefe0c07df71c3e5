use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;

use crate::error::CacheError;
use crate::key::{CacheKey, ResourceId};

/// The fetch behind a [`Resource`].
///
/// The cache treats a fetch as an opaque asynchronous operation. Timeouts, retries and
/// cancellation are the responsibility of the implementation.
pub trait ResourceFetch: Send + Sync + 'static {
    /// The input the fetch is invoked with.
    type Input: Serialize + Clone + Send + Sync + 'static;
    /// The value a successful fetch resolves to.
    type Output: Clone + Send + Sync + 'static;
    /// The error a failing fetch resolves to.
    type Error: Clone + Send + Sync + 'static;

    /// Fetches the value for `input`.
    fn fetch(&self, input: Self::Input) -> BoxFuture<'static, Result<Self::Output, Self::Error>>;

    /// Normalizes `input` into the value the cache key is derived from.
    ///
    /// Two inputs with structurally equal normalized values share a cache entry. Defaults to the
    /// serialized representation of the input.
    fn key(&self, input: &Self::Input) -> Result<Value, serde_json::Error> {
        serde_json::to_value(input)
    }
}

/// A [`ResourceFetch`] backed by a closure.
///
/// Created by [`Resource::from_fn`].
pub struct FnFetch<F, I> {
    f: F,
    _input: PhantomData<fn(I)>,
}

impl<F, I, Fut, T, E> ResourceFetch for FnFetch<F, I>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    I: Serialize + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Input = I;
    type Output = T;
    type Error = E;

    fn fetch(&self, input: I) -> BoxFuture<'static, Result<T, E>> {
        (self.f)(input).boxed()
    }
}

/// A named, fetchable thing that can be cached.
///
/// A resource gets its [`ResourceId`] when it is created. Clones share that identity, and with
/// it their cache entries.
pub struct Resource<F> {
    id: ResourceId,
    name: Arc<str>,
    persist: bool,
    fetch: Arc<F>,
}

impl<F> Clone for Resource<F> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: Arc::clone(&self.name),
            persist: self.persist,
            fetch: Arc::clone(&self.fetch),
        }
    }
}

impl<F> fmt::Debug for Resource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("persist", &self.persist)
            .finish_non_exhaustive()
    }
}

impl<F: ResourceFetch> Resource<F> {
    /// Defines a new resource.
    pub fn new(name: impl Into<Arc<str>>, fetch: F) -> Self {
        Self {
            id: ResourceId::new(),
            name: name.into(),
            persist: false,
            fetch: Arc::new(fetch),
        }
    }

    /// Marks the resource as persistent.
    ///
    /// Entries of persistent resources are never evicted.
    pub fn persistent(mut self) -> Self {
        self.persist = true;
        self
    }

    /// The name of this resource, used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether entries of this resource are exempt from eviction.
    pub fn is_persistent(&self) -> bool {
        self.persist
    }

    /// Computes the cache key for `input`.
    pub fn cache_key(&self, input: &F::Input) -> Result<CacheKey, CacheError> {
        let value = self
            .fetch
            .key(input)
            .map_err(|err| CacheError::InvalidKey(err.to_string()))?;
        CacheKey::from_value(self.id, Arc::clone(&self.name), &value)
            .map_err(|err| CacheError::InvalidKey(err.to_string()))
    }

    pub(crate) fn fetch(
        &self,
        input: F::Input,
    ) -> BoxFuture<'static, Result<F::Output, F::Error>> {
        self.fetch.fetch(input)
    }
}

impl<F, I> Resource<FnFetch<F, I>>
where
    FnFetch<F, I>: ResourceFetch,
{
    /// Defines a new resource that fetches by calling `f`.
    pub fn from_fn(name: impl Into<Arc<str>>, f: F) -> Self {
        Self::new(
            name,
            FnFetch {
                f,
                _input: PhantomData,
            },
        )
    }
}
