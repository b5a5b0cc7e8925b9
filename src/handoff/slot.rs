//! Single-slot broadcast with replay.
//!
//! At most one value is retained. A subscriber created after a publish still
//! sees the retained value once, then every later value. Publishing never
//! waits: when the slot is full, the value is handed back to the caller.
//!
//! State sits behind a `std` mutex and waiting goes through
//! [`tokio::sync::Notify`], which needs no runtime, so any executor can drive
//! [`Subscription::recv`].

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// What "full" means when a publish arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Never full; the retained value is replaced and lagging subscribers
    /// skip straight to the newest one.
    #[default]
    Overwrite,
    /// Full while any live subscriber has not yet observed the retained
    /// value; the new value is rejected. An idle subscription therefore
    /// blocks every later publish until it reads again.
    DropNewest,
}

#[derive(PartialEq, Eq)]
pub enum TryPublishError<T> {
    Full(T),
}

impl<T> TryPublishError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TryPublishError::Full(value) => value,
        }
    }
}

impl<T> fmt::Debug for TryPublishError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryPublishError::Full(_) => f.write_str("Full(..)"),
        }
    }
}

impl<T> fmt::Display for TryPublishError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryPublishError::Full(_) => {
                f.write_str("slot is full: a subscriber has not observed the retained value")
            }
        }
    }
}

impl<T> std::error::Error for TryPublishError<T> {}

struct State<T> {
    value: Option<T>,
    /// Bumped on every successful publish; 0 means nothing published yet.
    version: u64,
    /// Subscriber id -> last version it observed.
    cursors: HashMap<u64, u64>,
    next_subscriber: u64,
}

impl<T> State<T> {
    fn is_full(&self) -> bool {
        self.value.is_some() && self.cursors.values().any(|seen| *seen < self.version)
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    policy: OverflowPolicy,
}

impl<T> Shared<T> {
    // Critical sections never panic while holding the lock, so a poisoned
    // state is still consistent.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct SingleSlot<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SingleSlot<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone> SingleSlot<T> {
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    value: None,
                    version: 0,
                    cursors: HashMap::new(),
                    next_subscriber: 0,
                }),
                notify: Notify::new(),
                policy,
            }),
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    pub fn try_publish(&self, value: T) -> Result<(), TryPublishError<T>> {
        {
            let mut state = self.shared.lock();
            if self.shared.policy == OverflowPolicy::DropNewest && state.is_full() {
                return Err(TryPublishError::Full(value));
            }
            state.value = Some(value);
            state.version += 1;
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }

    pub fn latest(&self) -> Option<T> {
        self.shared.lock().value.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().cursors.len()
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let mut state = self.shared.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;

        // Start one behind so the retained value is replayed.
        let cursor = if state.value.is_some() {
            state.version - 1
        } else {
            state.version
        };
        state.cursors.insert(id, cursor);

        Subscription {
            shared: self.shared.clone(),
            id,
        }
    }
}

pub struct Subscription<T> {
    shared: Arc<Shared<T>>,
    id: u64,
}

impl<T: Clone> Subscription<T> {
    /// The next value this subscriber has not seen, if one is already there.
    pub fn try_recv(&mut self) -> Option<T> {
        let mut state = self.shared.lock();
        take_unseen(&mut state, self.id)
    }

    /// Waits for the next value this subscriber has not seen.
    pub async fn recv(&mut self) -> T {
        let shared = self.shared.clone();
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed.
            notified.as_mut().enable();

            if let Some(value) = self.try_recv() {
                return value;
            }
            notified.await;
        }
    }
}

fn take_unseen<T: Clone>(state: &mut State<T>, id: u64) -> Option<T> {
    let version = state.version;
    let cursor = state.cursors.get_mut(&id)?;
    if *cursor >= version {
        return None;
    }
    *cursor = version;
    state.value.clone()
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.shared.lock().cursors.remove(&self.id);
    }
}
