use thiserror::Error;

use crate::entry::StateKind;
use crate::key::CacheKey;

/// An error that indicates incorrect use of the cache.
///
/// These errors are never caused by a failing fetch. They point at a caller bug, such as
/// claiming an entry that was never accessed, and abort the offending operation without touching
/// the cache contents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The operation requires an entry that does not exist.
    #[error("{action}: no entry for `{key}`")]
    EntryMissing {
        /// The rejected action.
        action: &'static str,
        /// The key of the missing entry.
        key: CacheKey,
    },
    /// The entry is in a state that does not allow the operation.
    #[error("{action}: invalid transition from {state} for `{key}`")]
    InvalidTransition {
        /// The rejected action.
        action: &'static str,
        /// The state the entry was in.
        state: StateKind,
        /// The key of the entry.
        key: CacheKey,
    },
    /// A release was issued for an entry without outstanding claims.
    #[error("{action}: `{key}` is not claimed")]
    NotClaimed {
        /// The rejected action.
        action: &'static str,
        /// The key of the entry.
        key: CacheKey,
    },
    /// The input could not be normalized into a cache key.
    #[error("could not normalize cache key: {0}")]
    InvalidKey(String),
    /// The entry holds a value of a different type than requested.
    #[error("entry `{key}` holds a value of a different type")]
    TypeMismatch {
        /// The key of the entry.
        key: CacheKey,
    },
    /// The fetch for the entry went away before it settled.
    ///
    /// This happens when the fetch panics, or when the runtime driving it shuts down. A panicked
    /// fetch removes its entry, so the next access starts a new fetch.
    #[error("entry `{key}` was abandoned before it settled")]
    Abandoned {
        /// The key of the entry.
        key: CacheKey,
    },
}

/// The error returned when reading a value through the cache.
#[derive(Debug, Error)]
pub enum AccessError<E> {
    /// The resource fetch failed.
    ///
    /// The error is cached verbatim, and every read of the entry observes it until the entry is
    /// patched or evicted.
    #[error("resource fetch failed")]
    Fetch(E),
    /// The cache was used incorrectly.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl<E> AccessError<E> {
    /// Returns the fetch error, if this is one.
    pub fn fetch_error(&self) -> Option<&E> {
        match self {
            Self::Fetch(err) => Some(err),
            Self::Cache(_) => None,
        }
    }
}
