//! Listener registry with subscription handles.
//!
//! Callbacks are invoked outside the registry lock, so a listener may
//! subscribe or unsubscribe from inside its own callback.

use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::error;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
}

impl<T> Detach for Mutex<ListenerSet<T>> {
    fn detach(&self, id: u64) -> bool {
        let mut set = self.lock();
        let before = set.callbacks.len();
        set.callbacks.retain(|(existing, _)| *existing != id);
        set.callbacks.len() != before
    }
}

/// Ordered set of callbacks for one kind of notification
pub struct Listeners<T> {
    set: Arc<Mutex<ListenerSet<T>>>,
}

impl<T: 'static> Listeners<T> {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            set: Arc::new(Mutex::new(ListenerSet {
                next_id: 1,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Register a callback; it stays registered while the handle lives
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut set = self.set.lock();
            let id = set.next_id;
            set.next_id += 1;
            set.callbacks.push((id, Arc::new(callback)));
            id
        };
        let registry: Weak<dyn Detach> = Arc::downgrade(&self.set) as Weak<dyn Detach>;
        Subscription {
            id,
            registry: Some(registry),
        }
    }

    /// Call every listener in registration order, returning how many ran
    ///
    /// A panicking listener is logged and does not stop the others.
    pub fn emit(&self, value: &T) -> usize {
        let snapshot: Vec<Callback<T>> = self
            .set
            .lock()
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                error!("Listener panicked; continuing with the remaining listeners");
            }
        }
        snapshot.len()
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.set.lock().callbacks.len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.set.lock().callbacks.len())
            .finish()
    }
}

/// Handle to a registered listener
///
/// Dropping the handle removes the listener. Use [`forget`](Self::forget)
/// to keep it for the lifetime of the registry.
pub struct Subscription {
    id: u64,
    registry: Option<Weak<dyn Detach>>,
}

impl Subscription {
    /// Remove the listener, returning whether it was still registered
    pub fn unsubscribe(mut self) -> bool {
        self.detach()
    }

    /// Keep the listener registered without holding the handle
    pub fn forget(mut self) {
        self.registry = None;
    }

    fn detach(&mut self) -> bool {
        match self.registry.take().and_then(|weak| weak.upgrade()) {
            Some(registry) => registry.detach(self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_every_listener_in_order() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let seen = seen.clone();
            listeners.subscribe(move |v| seen.lock().push(("a", *v)))
        };
        let b = {
            let seen = seen.clone();
            listeners.subscribe(move |v| seen.lock().push(("b", *v)))
        };

        assert_eq!(listeners.emit(&7), 2);
        assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7)]);
        drop((a, b));
    }

    #[test]
    fn test_unsubscribe_and_drop_remove_listener() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let first = {
            let count = count.clone();
            listeners.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let second = {
            let count = count.clone();
            listeners.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(first.unsubscribe());
        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 3);

        drop(second);
        assert!(listeners.is_empty());
        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_forget_keeps_listener() {
        let listeners: Listeners<()> = Listeners::new();
        listeners.subscribe(|_| {}).forget();
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));
        let _bad = listeners.subscribe(|_| panic!("listener failure"));
        let _good = {
            let count = count.clone();
            listeners.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_outliving_registry() {
        let listeners: Listeners<()> = Listeners::new();
        let subscription = listeners.subscribe(|_| {});
        drop(listeners);
        assert!(!subscription.unsubscribe());
    }
}
