//! The transition engine of the cache store.
//!
//! Every mutation of the [`Store`] is expressed as an [`Action`]. [`Store::apply`] checks that
//! the action is legal for the current state of the affected entry before changing anything, so
//! a rejected action never leaves a partially updated store behind.

use std::time::Duration;

use tokio::time::Instant;

use crate::entry::{AnyValue, EntryState, ErasedState};
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::observers::{Change, StoreEvent};
use crate::store::{Slot, Store};

/// Updates the state of an entry in place.
///
/// Returning `Ok(None)` leaves the entry untouched.
pub(crate) type PatchFn<'a> =
    Box<dyn FnOnce(&ErasedState) -> Result<Option<ErasedState>, CacheError> + 'a>;

pub(crate) enum Action<'a> {
    /// Creates a new entry in the `Init` state.
    Init { key: CacheKey, persist: bool },
    /// Marks the fetch of an entry as started.
    Request { key: CacheKey },
    /// Settles an entry with the outcome of its fetch.
    Response {
        key: CacheKey,
        result: Result<AnyValue, AnyValue>,
    },
    /// Removes an entry whose fetch went away without an outcome.
    Abandon { key: CacheKey },
    /// Applies an arbitrary update to an entry.
    Patch {
        key: CacheKey,
        update: PatchFn<'a>,
        silent: bool,
    },
    /// Adds a claim to an entry.
    Claim { key: CacheKey },
    /// Removes a claim from an entry.
    Release { key: CacheKey, released_at: Instant },
    /// Evicts every entry that has been unclaimed for at least `release_time`.
    Sweep { now: Instant, release_time: Duration },
}

impl Action<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "Init",
            Self::Request { .. } => "Request",
            Self::Response { .. } => "Response",
            Self::Abandon { .. } => "Abandon",
            Self::Patch { .. } => "Patch",
            Self::Claim { .. } => "Claim",
            Self::Release { .. } => "Release",
            Self::Sweep { .. } => "Sweep",
        }
    }
}

fn entry_mut<'s>(
    store: &'s mut Store,
    action: &'static str,
    key: &CacheKey,
) -> Result<&'s mut Slot, CacheError> {
    store
        .entries
        .get_mut(key)
        .ok_or_else(|| CacheError::EntryMissing {
            action,
            key: key.clone(),
        })
}

fn invalid(action: &'static str, slot: &Slot, key: CacheKey) -> CacheError {
    CacheError::InvalidTransition {
        action,
        state: slot.state.kind(),
        key,
    }
}

impl Store {
    /// Applies `action`, returning the resulting changes.
    ///
    /// An empty list of changes means the action was a no-op, like a response for an entry that
    /// has been evicted in the meantime.
    pub fn apply(&mut self, action: Action<'_>) -> Result<Vec<StoreEvent>, CacheError> {
        let name = action.name();
        match action {
            Action::Init { key, persist } => {
                if let Some(slot) = self.entries.get(&key) {
                    return Err(invalid(name, slot, key));
                }
                self.entries.insert(key.clone(), Slot::new(persist));
                Ok(vec![StoreEvent::new(key, Change::Created)])
            }
            Action::Request { key } => {
                let slot = entry_mut(self, name, &key)?;
                if !matches!(slot.state, EntryState::Init) {
                    return Err(invalid(name, slot, key));
                }
                slot.set_state(EntryState::Pending);
                Ok(vec![StoreEvent::new(key, Change::Pending)])
            }
            Action::Response { key, result } => {
                let Some(slot) = self.entries.get_mut(&key) else {
                    // released before the response arrived
                    return Ok(vec![]);
                };
                if !matches!(slot.state, EntryState::Pending) {
                    return Err(invalid(name, slot, key));
                }
                let state = ErasedState::from(result);
                let kind = state.kind();
                slot.set_state(state);
                Ok(vec![StoreEvent::new(key, Change::Settled(kind))])
            }
            Action::Abandon { key } => {
                // entries settled by a patch keep their value
                match self.entries.get(&key) {
                    Some(slot) if matches!(slot.state, EntryState::Pending) => {}
                    _ => return Ok(vec![]),
                }
                self.entries.remove(&key);
                Ok(vec![StoreEvent::new(key, Change::Abandoned)])
            }
            Action::Patch {
                key,
                update,
                silent,
            } => {
                let Some(slot) = self.entries.get_mut(&key) else {
                    if silent {
                        return Ok(vec![]);
                    }
                    return Err(CacheError::EntryMissing { action: name, key });
                };
                match update(&slot.state)? {
                    Some(state) => {
                        let kind = state.kind();
                        slot.set_state(state);
                        Ok(vec![StoreEvent::new(key, Change::Patched(kind))])
                    }
                    None => Ok(vec![]),
                }
            }
            Action::Claim { key } => {
                let slot = entry_mut(self, name, &key)?;
                slot.refcount += 1;
                slot.released_at = None;
                Ok(vec![StoreEvent::new(key, Change::Claimed(slot.refcount))])
            }
            Action::Release { key, released_at } => {
                let slot = entry_mut(self, name, &key)?;
                if slot.refcount == 0 {
                    return Err(CacheError::NotClaimed { action: name, key });
                }
                slot.refcount -= 1;
                if slot.refcount == 0 {
                    slot.released_at = Some(released_at);
                }
                Ok(vec![StoreEvent::new(key, Change::Released(slot.refcount))])
            }
            Action::Sweep { now, release_time } => {
                let mut events = vec![];
                self.entries.retain(|key, slot| {
                    let keep = slot.persist
                        || slot.refcount > 0
                        || slot.released_at.is_none_or(|released_at| {
                            now.saturating_duration_since(released_at) < release_time
                        });
                    if !keep {
                        events.push(StoreEvent::new(key.clone(), Change::Evicted));
                    }
                    keep
                });
                Ok(events)
            }
        }
    }
}
