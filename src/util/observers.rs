//! Observer fan-out shared by every change-notification point.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by [`ObserverSet::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

/// A set of observers for events of type `E`.
///
/// Invocation order between observers is unspecified. A panicking observer
/// is isolated so the remaining observers still run.
pub struct ObserverSet<E> {
    observers: Mutex<Vec<(u64, Callback<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for ObserverSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ObserverSet<E> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .lock()
            .expect("observer lock poisoned")
            .push((id, Arc::new(callback)));
        Subscription(id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.observers
            .lock()
            .expect("observer lock poisoned")
            .retain(|(id, _)| *id != subscription.0);
    }

    pub fn clear(&self) {
        self.observers
            .lock()
            .expect("observer lock poisoned")
            .clear();
    }

    /// Invoke every observer once with `event`.
    ///
    /// Callbacks are cloned out of the lock first so an observer may
    /// subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self
            .observers
            .lock()
            .expect("observer lock poisoned")
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!("observer panicked during notification");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.observers.lock().expect("observer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
