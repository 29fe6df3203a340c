use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::SessionError;

pub type NextFn<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;
pub type ErrorFn = Arc<dyn Fn(&SessionError) + Send + Sync + 'static>;

pub struct PartialObserver<T> {
    pub next: Option<NextFn<T>>,
    pub error: Option<ErrorFn>,
}

impl<T> Clone for PartialObserver<T> {
    fn clone(&self) -> Self {
        Self {
            next: self.next.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T> PartialObserver<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_next<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.next = Some(Arc::new(callback));
        self
    }

    pub fn with_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SessionError) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(callback));
        self
    }
}

impl<T> Default for PartialObserver<T> {
    fn default() -> Self {
        Self {
            next: None,
            error: None,
        }
    }
}

pub type Unsubscribe = Box<dyn FnOnce() + Send + 'static>;

/// Fan-out list of observers. Callbacks run outside the internal lock so an
/// observer may register or remove observers while being notified.
pub struct ObserverList<T> {
    next_id: AtomicU64,
    observers: Arc<Mutex<Vec<(u64, PartialObserver<T>)>>>,
}

impl<T: 'static> ObserverList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: PartialObserver<T>) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.observers.lock().unwrap().push((id, observer));
        let observers = Arc::downgrade(&self.observers);
        Box::new(move || {
            if let Some(observers) = observers.upgrade() {
                observers.lock().unwrap().retain(|(entry, _)| *entry != id);
            }
        })
    }

    pub fn notify(&self, value: &T) {
        for observer in self.snapshot() {
            if let Some(next) = observer.next {
                next(value);
            }
        }
    }

    pub fn notify_error(&self, error: &SessionError) {
        for observer in self.snapshot() {
            if let Some(callback) = observer.error {
                callback(error);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<PartialObserver<T>> {
        self.observers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }
}

impl<T> Default for ObserverList<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            observers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}
