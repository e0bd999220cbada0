//! Observer registration handles.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle returned by every `on_*` registration.
///
/// Calling [`Unsubscribe::unsubscribe`] removes the registration. Dropping the
/// handle leaves the registration in place.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Unsubscribe {
    f: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            f: Some(Box::new(f)),
        }
    }

    /// A handle that does nothing.
    pub fn noop() -> Self {
        Self { f: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.f.is_some())
            .finish()
    }
}

pub type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A set of synchronous observers keyed by registration id.
pub(crate) struct Observers<T> {
    next_id: AtomicU64,
    handlers: Arc<DashMap<u64, Observer<T>>>,
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self, handler: Observer<T>) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.insert(id, handler);
        let handlers = Arc::downgrade(&self.handlers);
        Unsubscribe::new(move || {
            if let Some(handlers) = handlers.upgrade() {
                handlers.remove(&id);
            }
        })
    }

    /// Invoke every observer. The map is not locked while observers run, so
    /// an observer may register or unregister others.
    pub fn emit(&self, value: &T) {
        let handlers: Vec<Observer<T>> = self
            .handlers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for handler in handlers {
            handler(value);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }
}

impl<T: 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let observers: Observers<u32> = Observers::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let handle = observers.subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        observers.emit(&1);
        handle.unsubscribe();
        observers.emit(&2);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(observers.is_empty());
    }
}
