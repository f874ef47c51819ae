use crate::error::Error;
use parking_lot::Mutex;
use std::sync::Arc;

/// Receives items pushed by a [`Subject`].
///
/// Plays the role of `IObserver<T>` / the reactive-runtime collaborator's
/// subscriber interface. `on_error` is terminal: once delivered, the subject
/// that sent it will not deliver anything else to that observer.
pub trait Observer<T>: Send + Sync {
    fn on_next(&self, item: &T);
    fn on_error(&self, error: &Error);
    fn on_completed(&self);
}

struct Entry<T> {
    id: u64,
    observer: Arc<dyn Observer<T>>,
}

struct State<T> {
    observers: Vec<Entry<T>>,
    next_id: u64,
    terminated: bool,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        State { observers: Vec::new(), next_id: 0, terminated: false }
    }
}

/// A multicast publisher: the `publish`/`connect` primitive required by
/// §6. Every source collection and every operator that needs to fan its
/// output out to more than one downstream keeps one of these.
///
/// Broadcasting never holds the internal lock across a subscriber's
/// callback: the observer list is cloned out from under the lock first
/// (§5 — "locks are never held across a downstream operator's work for
/// arbitrary user code").
pub struct Subject<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Subject { state: self.state.clone() }
    }
}

impl<T> Default for Subject<T> {
    fn default() -> Self {
        Subject { state: Arc::new(Mutex::new(State::default())) }
    }
}

impl<T> Subject<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer` and returns a disposal handle. Disposal is
    /// idempotent (§5 — "disposal is idempotent").
    pub fn subscribe(&self, observer: Arc<dyn Observer<T>>) -> Subscription<T> {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.observers.push(Entry { id, observer });
            id
        };
        Subscription { state: Arc::downgrade(&self.state), id }
    }

    pub fn on_next(&self, item: &T) {
        let observers: Vec<_> = {
            let state = self.state.lock();
            if state.terminated {
                return;
            }
            state.observers.iter().map(|e| e.observer.clone()).collect()
        };
        for observer in observers {
            observer.on_next(item);
        }
    }

    /// Terminates the subject: every current subscriber receives exactly
    /// one `on_error`, and no further notifications are delivered (§7 —
    /// "on_error is terminal for that subscription").
    pub fn on_error(&self, error: &Error) {
        let observers: Vec<_> = {
            let mut state = self.state.lock();
            state.terminated = true;
            state.observers.drain(..).map(|e| e.observer).collect()
        };
        for observer in observers {
            observer.on_error(error);
        }
    }

    pub fn on_completed(&self) {
        let observers: Vec<_> = {
            let mut state = self.state.lock();
            state.terminated = true;
            state.observers.drain(..).map(|e| e.observer).collect()
        };
        for observer in observers {
            observer.on_completed();
        }
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }
}

/// Disposal handle returned by [`Subject::subscribe`]. Dropping it is
/// equivalent to calling [`Subscription::dispose`].
pub struct Subscription<T> {
    state: std::sync::Weak<Mutex<State<T>>>,
    id: u64,
}

impl<T> Subscription<T> {
    /// Removes the observer from the subject. Safe to call more than once,
    /// and safe to call after the subject itself has been dropped.
    pub fn dispose(&self) {
        if let Some(state) = self.state.upgrade() {
            let mut state = state.lock();
            state.observers.retain(|e| e.id != self.id);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as StdMutex;

    struct Collector(StdMutex<Vec<i32>>);

    impl Observer<i32> for Collector {
        fn on_next(&self, item: &i32) {
            self.0.lock().push(*item);
        }
        fn on_error(&self, _error: &Error) {}
        fn on_completed(&self) {}
    }

    #[test]
    fn broadcasts_to_all_subscribers() {
        let subject = Subject::new();
        let a = Arc::new(Collector(StdMutex::new(Vec::new())));
        let b = Arc::new(Collector(StdMutex::new(Vec::new())));
        let _sub_a = subject.subscribe(a.clone());
        let _sub_b = subject.subscribe(b.clone());
        subject.on_next(&1);
        subject.on_next(&2);
        assert_eq!(*a.0.lock(), vec![1, 2]);
        assert_eq!(*b.0.lock(), vec![1, 2]);
    }

    #[test]
    fn dispose_stops_delivery() {
        let subject = Subject::new();
        let a = Arc::new(Collector(StdMutex::new(Vec::new())));
        let sub_a = subject.subscribe(a.clone());
        subject.on_next(&1);
        sub_a.dispose();
        subject.on_next(&2);
        assert_eq!(*a.0.lock(), vec![1]);
    }

    #[test]
    fn drop_disposes() {
        let subject = Subject::new();
        let a = Arc::new(Collector(StdMutex::new(Vec::new())));
        {
            let _sub_a = subject.subscribe(a.clone());
            assert_eq!(subject.observer_count(), 1);
        }
        assert_eq!(subject.observer_count(), 0);
    }
}
