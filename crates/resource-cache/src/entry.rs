use std::any::Any;
use std::fmt;
use std::future::IntoFuture;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{AccessError, CacheError};
use crate::key::CacheKey;

/// The lifecycle state of a cache [`Entry`].
///
/// States only advance along `Init -> Pending -> Ok | Err`. The terminal states can only be
/// changed by an explicit patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState<T, E> {
    /// The entry exists, but its fetch has not been started yet.
    Init,
    /// The fetch is in flight.
    Pending,
    /// The fetch succeeded.
    Ok(T),
    /// The fetch failed.
    Err(E),
}

impl<T, E> EntryState<T, E> {
    /// Whether the entry has reached one of the terminal states.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ok(_) | Self::Err(_))
    }

    /// The kind of this state, without its payload.
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Init => StateKind::Init,
            Self::Pending => StateKind::Pending,
            Self::Ok(_) => StateKind::Ok,
            Self::Err(_) => StateKind::Err,
        }
    }
}

impl<T, E> From<Result<T, E>> for EntryState<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) => Self::Err(err),
        }
    }
}

/// The kind of an [`EntryState`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    /// See [`EntryState::Init`].
    Init,
    /// See [`EntryState::Pending`].
    Pending,
    /// See [`EntryState::Ok`].
    Ok,
    /// See [`EntryState::Err`].
    Err,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "Init",
            Self::Pending => "Pending",
            Self::Ok => "Ok",
            Self::Err => "Err",
        })
    }
}

/// A type-erased value as it lives in the store.
pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// An [`EntryState`] with type-erased payloads.
pub(crate) type ErasedState = EntryState<AnyValue, AnyValue>;

/// Erases the payload types of `state`.
pub(crate) fn erase<T, E>(state: EntryState<T, E>) -> ErasedState
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    match state {
        EntryState::Init => EntryState::Init,
        EntryState::Pending => EntryState::Pending,
        EntryState::Ok(value) => EntryState::Ok(Arc::new(value)),
        EntryState::Err(err) => EntryState::Err(Arc::new(err)),
    }
}

/// Recovers the payload types of `state`.
///
/// Returns `None` if a payload is of a different type.
pub(crate) fn downcast<T, E>(state: &ErasedState) -> Option<EntryState<T, E>>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    Some(match state {
        EntryState::Init => EntryState::Init,
        EntryState::Pending => EntryState::Pending,
        EntryState::Ok(value) => EntryState::Ok(value.downcast_ref::<T>()?.clone()),
        EntryState::Err(err) => EntryState::Err(err.downcast_ref::<E>()?.clone()),
    })
}

/// A snapshot of a cache entry.
///
/// The snapshot reflects the entry at the time it was read from the cache. Use
/// [`future`](Self::future) to wait for the entry to settle.
pub struct Entry<T, E> {
    pub(crate) key: CacheKey,
    pub(crate) state: EntryState<T, E>,
    pub(crate) refcount: usize,
    pub(crate) released_at: Option<Instant>,
    pub(crate) future: EntryFuture<T, E>,
}

impl<T, E> Entry<T, E> {
    /// The key of this entry.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The state of this entry.
    pub fn state(&self) -> &EntryState<T, E> {
        &self.state
    }

    /// Consumes the snapshot, returning its state.
    pub fn into_state(self) -> EntryState<T, E> {
        self.state
    }

    /// The number of outstanding claims.
    pub fn refcount(&self) -> usize {
        self.refcount
    }

    /// When the last claim was released, if the entry is unclaimed.
    pub fn released_at(&self) -> Option<Instant> {
        self.released_at
    }

    /// A handle that resolves once this entry settles.
    pub fn future(&self) -> EntryFuture<T, E> {
        self.future.clone()
    }
}

impl<T: Clone, E: Clone> Clone for Entry<T, E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            state: self.state.clone(),
            refcount: self.refcount,
            released_at: self.released_at,
            future: self.future.clone(),
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Entry<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("refcount", &self.refcount)
            .field("released_at", &self.released_at)
            .finish_non_exhaustive()
    }
}

/// A shared handle to the outcome of an entry.
///
/// All callers that accessed the same entry hold handles to the same underlying channel. The
/// handle resolves with the latest settled value, so a value patched after the fetch completed
/// is observed by everyone awaiting the handle afterwards.
pub struct EntryFuture<T, E> {
    key: CacheKey,
    receiver: watch::Receiver<ErasedState>,
    _types: PhantomData<fn() -> (T, E)>,
}

impl<T, E> Clone for EntryFuture<T, E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            receiver: self.receiver.clone(),
            _types: PhantomData,
        }
    }
}

impl<T, E> EntryFuture<T, E> {
    pub(crate) fn new(key: CacheKey, receiver: watch::Receiver<ErasedState>) -> Self {
        Self {
            key,
            receiver,
            _types: PhantomData,
        }
    }

    /// Whether both handles belong to the same entry.
    ///
    /// An entry that was evicted and created again for the same key is a different entry.
    pub fn same_entry(&self, other: &Self) -> bool {
        self.receiver.same_channel(&other.receiver)
    }
}

impl<T, E> EntryFuture<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Waits for the entry to settle and returns its latest value.
    pub async fn settled(mut self) -> Result<T, AccessError<E>> {
        let state = match self.receiver.wait_for(EntryState::is_settled).await {
            Ok(state) => state.clone(),
            Err(_) => return Err(CacheError::Abandoned { key: self.key }.into()),
        };

        match downcast::<T, E>(&state) {
            Some(EntryState::Ok(value)) => Ok(value),
            Some(EntryState::Err(err)) => Err(AccessError::Fetch(err)),
            _ => Err(CacheError::TypeMismatch { key: self.key }.into()),
        }
    }
}

impl<T, E> IntoFuture for EntryFuture<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Output = Result<T, AccessError<E>>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.settled().boxed()
    }
}
