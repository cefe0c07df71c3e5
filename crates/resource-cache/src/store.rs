use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::entry::{Entry, EntryFuture, EntryState, ErasedState, downcast};
use crate::error::CacheError;
use crate::key::CacheKey;

/// The bookkeeping record of a single cache entry.
pub(crate) struct Slot {
    pub state: ErasedState,
    pub refcount: usize,
    pub released_at: Option<Instant>,
    /// Entries of persistent resources are never evicted.
    pub persist: bool,
    /// Publishes every state change to the [`EntryFuture`]s handed out for this entry.
    pub channel: Arc<watch::Sender<ErasedState>>,
}

impl Slot {
    pub fn new(persist: bool) -> Self {
        let (channel, _) = watch::channel(EntryState::Init);
        Self {
            state: EntryState::Init,
            refcount: 0,
            released_at: None,
            persist,
            channel: Arc::new(channel),
        }
    }

    /// Replaces the state and publishes it to everyone holding a handle to this entry.
    pub fn set_state(&mut self, state: ErasedState) {
        self.channel.send_replace(state.clone());
        self.state = state;
    }

    /// Creates a typed snapshot of this slot.
    pub fn snapshot<T, E>(&self, key: &CacheKey) -> Result<Entry<T, E>, CacheError>
    where
        T: Clone + 'static,
        E: Clone + 'static,
    {
        let state = downcast(&self.state).ok_or_else(|| CacheError::TypeMismatch {
            key: key.clone(),
        })?;

        Ok(Entry {
            key: key.clone(),
            state,
            refcount: self.refcount,
            released_at: self.released_at,
            future: EntryFuture::new(key.clone(), self.channel.subscribe()),
        })
    }
}

/// The mapping of cache keys to entries.
///
/// The store is only ever mutated through [`Store::apply`], which validates an action before
/// touching any entry.
#[derive(Default)]
pub(crate) struct Store {
    pub(crate) entries: HashMap<CacheKey, Slot>,
}

impl Store {
    pub fn get(&self, key: &CacheKey) -> Option<&Slot> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
