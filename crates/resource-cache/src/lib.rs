//! An in-process cache for asynchronous resource fetches.
//!
//! A [`ResourceCache`] memoizes the result of fetching a [`Resource`] for a given input, keyed by
//! the resource identity and a canonical form of the input. Concurrent requests for the same key
//! are coalesced onto a single fetch, and every cached [`Entry`] moves through an explicit
//! `Init -> Pending -> Ok | Err` lifecycle.
//!
//! Entries are reference counted through [`ResourceCache::claim`] and
//! [`ResourceCache::release`] (or a [`Lease`]), and a background sweep evicts entries that have
//! been unreferenced for longer than the configured grace window.

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

mod cache;
pub mod config;
mod entry;
mod error;
mod key;
pub mod logging;
mod observers;
mod resource;
mod store;
mod sweep;
mod transition;

pub use cache::{Lease, ResourceCache};
pub use entry::{Entry, EntryFuture, EntryState, StateKind};
pub use error::{AccessError, CacheError};
pub use key::{CacheKey, ResourceId};
pub use observers::{Change, StoreEvent, Subscription};
pub use resource::{FnFetch, Resource, ResourceFetch};
