use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backend::{BackendError, BackendResult};
use crate::error::SessionResult;
use crate::util::subscribe::Unsubscribe;

use super::types::{ResourceKind, SubscriptionKey};

struct Entry {
    id: u64,
    teardown: Unsubscribe,
}

/// Keys whose factory is still running, with the number of callers starting
/// them and whether an error was reported before the entry existed.
#[derive(Default)]
struct Starting {
    callers: usize,
    failed: bool,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<SubscriptionKey, Entry>,
    starting: HashMap<SubscriptionKey, Starting>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    fn take_if(&self, key: &SubscriptionKey, id: Option<u64>) -> Option<Unsubscribe> {
        let mut state = self.state.lock().unwrap();
        match state.entries.get(key) {
            Some(entry) if id.map_or(true, |id| entry.id == id) => {
                state.entries.remove(key).map(|entry| entry.teardown)
            }
            _ => None,
        }
    }
}

/// Handle to a registry entry. Every handle returned for the same live
/// subscription refers to the same underlying listener; the first
/// [`ListenerHandle::unsubscribe`] tears it down and later calls are no-ops.
///
/// Dropping a handle does not unsubscribe.
#[derive(Clone, Debug)]
pub struct ListenerHandle {
    key: SubscriptionKey,
    id: u64,
    registry: Weak<RegistryInner>,
}

impl ListenerHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Tears down the subscription. Returns `false` when it was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        match registry.take_if(&self.key, Some(self.id)) {
            Some(teardown) => {
                log::debug!("listener {} unsubscribed", self.key);
                teardown();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| {
                registry
                    .state
                    .lock()
                    .unwrap()
                    .entries
                    .get(&self.key)
                    .is_some_and(|entry| entry.id == self.id)
            })
            .unwrap_or(false)
    }
}

impl PartialEq for ListenerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.id == other.id
    }
}

#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live subscription for `(resource_kind, filter_key)`, or
    /// calls `factory` to create one.
    ///
    /// `factory` runs without the registry lock held, so it may synchronously
    /// deliver callbacks that touch the registry. If `factory` fails the error
    /// is logged and no entry is recorded. If the new listener reports an
    /// error through [`ListenerRegistry::report_error`] before `factory`
    /// returns, it is torn down at once and the returned handle is inactive.
    pub fn subscribe<F>(
        &self,
        resource_kind: impl Into<ResourceKind>,
        filter_key: impl Into<String>,
        factory: F,
    ) -> SessionResult<ListenerHandle>
    where
        F: FnOnce() -> BackendResult<Unsubscribe>,
    {
        let key = SubscriptionKey::new(resource_kind, filter_key);
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(entry) = state.entries.get(&key) {
                log::debug!("listener {key} already active; reusing it");
                let id = entry.id;
                drop(state);
                return Ok(self.handle(key, id));
            }
            state.starting.entry(key.clone()).or_default().callers += 1;
        }

        let result = factory();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        let mut state = self.inner.state.lock().unwrap();
        let failed = finish_starting(&mut state, &key);
        let teardown = match result {
            Ok(teardown) => teardown,
            Err(err) => {
                drop(state);
                log::warn!("failed to start listener {key}: {err}");
                return Err(err.into());
            }
        };
        if failed {
            drop(state);
            log::debug!("listener {key} failed while starting; not recorded");
            teardown();
            return Ok(self.handle(key, id));
        }
        if let Some(entry) = state.entries.get(&key) {
            // Another caller registered the same key while the factory ran.
            let id = entry.id;
            drop(state);
            teardown();
            return Ok(self.handle(key, id));
        }
        state.entries.insert(key.clone(), Entry { id, teardown });
        drop(state);

        log::debug!("listener {key} started");
        Ok(self.handle(key, id))
    }

    pub fn unsubscribe(&self, handle: &ListenerHandle) -> bool {
        handle.unsubscribe()
    }

    /// Drops the entry for `key` after its listener reported `error`. The
    /// subscription is not restarted. Returns `false` when there was nothing
    /// live or starting under `key`.
    pub fn report_error(&self, key: &SubscriptionKey, error: &BackendError) -> bool {
        log::warn!("listener {key} failed: {error}{}", error.diagnostic_hint());
        let mut state = self.inner.state.lock().unwrap();
        if let Some(entry) = state.entries.remove(key) {
            drop(state);
            (entry.teardown)();
            return true;
        }
        match state.starting.get_mut(key) {
            Some(starting) => {
                starting.failed = true;
                true
            }
            None => false,
        }
    }

    /// Tears down every live subscription and returns how many there were.
    pub fn unsubscribe_all(&self) -> usize {
        let drained: Vec<(SubscriptionKey, Entry)> =
            self.inner.state.lock().unwrap().entries.drain().collect();
        let count = drained.len();
        for (key, entry) in drained {
            log::debug!("listener {key} torn down");
            (entry.teardown)();
        }
        count
    }

    pub fn handle_for(&self, key: &SubscriptionKey) -> Option<ListenerHandle> {
        let state = self.inner.state.lock().unwrap();
        state
            .entries
            .get(key)
            .map(|entry| self.handle(key.clone(), entry.id))
    }

    pub fn is_active(&self, key: &SubscriptionKey) -> bool {
        self.inner.state.lock().unwrap().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.inner
            .state
            .lock()
            .unwrap()
            .entries
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(&self, key: SubscriptionKey, id: u64) -> ListenerHandle {
        ListenerHandle {
            key,
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }
}

/// Releases one caller's claim on a starting key and reports whether an error
/// arrived while it was starting.
fn finish_starting(state: &mut RegistryState, key: &SubscriptionKey) -> bool {
    let Some(starting) = state.starting.get_mut(key) else {
        return false;
    };
    let failed = starting.failed;
    starting.callers -= 1;
    if starting.callers == 0 {
        state.starting.remove(key);
    }
    failed
}
