use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::entry::StateKind;
use crate::key::CacheKey;

/// A change that was applied to a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// The entry was created in the `Init` state.
    Created,
    /// The fetch for the entry was started.
    Pending,
    /// The fetch settled into the given state.
    Settled(StateKind),
    /// The entry was patched, and is now in the given state.
    Patched(StateKind),
    /// The entry was claimed, and now has the given number of claims.
    Claimed(usize),
    /// A claim was released, leaving the given number of claims.
    Released(usize),
    /// The entry was evicted.
    Evicted,
    /// The fetch for the entry panicked, and the entry was removed.
    Abandoned,
}

/// A notification about a mutation of the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// The key of the affected entry.
    pub key: CacheKey,
    /// What happened to the entry.
    pub change: Change,
}

impl StoreEvent {
    pub(crate) fn new(key: CacheKey, change: Change) -> Self {
        Self { key, change }
    }
}

type Callback = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Events waiting to be delivered, in the order they were applied.
#[derive(Default)]
struct Queue {
    events: VecDeque<StoreEvent>,
    /// Set while some thread is delivering events.
    draining: bool,
}

/// The list of callbacks subscribed to cache mutations.
///
/// Events are queued while the store lock is held and delivered after it has been released. Only
/// one thread delivers at a time, so callbacks observe events in the order they were applied,
/// even when operations race on different threads.
#[derive(Default)]
pub(crate) struct Observers {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    queue: Mutex<Queue>,
}

/// Clears the draining flag if a callback panics.
struct DrainGuard<'a>(&'a Observers);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.lock_queue().draining = false;
    }
}

impl Observers {
    pub fn subscribe(self: &Arc<Self>, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, callback));
        Subscription {
            observers: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().retain(|(callback_id, _)| *callback_id != id);
    }

    /// Queues `events` for delivery.
    ///
    /// Must be called with the store lock held.
    pub fn enqueue(&self, events: &mut Vec<StoreEvent>) {
        if events.is_empty() {
            return;
        }
        self.lock_queue().events.extend(events.drain(..));
    }

    /// Delivers all queued events.
    ///
    /// If another thread is already delivering, it picks up the queued events instead and this
    /// returns right away. The same applies to a callback that uses the cache: its events are
    /// delivered once the current callback returns.
    pub fn deliver(&self) {
        {
            let mut queue = self.lock_queue();
            if queue.draining || queue.events.is_empty() {
                return;
            }
            queue.draining = true;
        }

        let guard = DrainGuard(self);
        loop {
            let events: Vec<_> = {
                let mut queue = self.lock_queue();
                if queue.events.is_empty() {
                    // reset under the same lock, so no queued event is left behind
                    queue.draining = false;
                    std::mem::forget(guard);
                    return;
                }
                queue.events.drain(..).collect()
            };
            self.notify(&events);
        }
    }

    /// Invokes every callback for every event.
    ///
    /// Callbacks are invoked outside of the subscriber lock, so a callback may itself subscribe,
    /// unsubscribe, or use the cache.
    fn notify(&self, events: &[StoreEvent]) {
        let callbacks: Vec<_> = self.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for event in events {
            for callback in &callbacks {
                callback(event);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Callback)>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A subscription to cache mutations.
///
/// The callback stays registered until the subscription is dropped or
/// [`unsubscribe`](Self::unsubscribe) is called.
#[must_use = "dropping a subscription unsubscribes its callback"]
pub struct Subscription {
    observers: Weak<Observers>,
    id: u64,
}

impl Subscription {
    /// Removes the callback.
    pub fn unsubscribe(self) {
        drop(self)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.unsubscribe(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
