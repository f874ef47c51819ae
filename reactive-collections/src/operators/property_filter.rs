//! Property filter (§4.3.1): a dynamic filter whose re-evaluate pulses are
//! driven by a per-item "this mutated" capability instead of an external
//! pulse stream.
//!
//! Spec.md treats concrete property-change notification as an external
//! collaborator (§1, out of scope) and models the requirement on the core
//! as a bare capability (§6, §9): "given an item, produce a lazy sequence
//! of 'this item mutated' events". Rather than requiring a trait bound
//! (which would force every item type in the crate to implement it, even
//! when unused), that capability is threaded through as a plain
//! `subscribe_mutations` closure — the same "plain `Fn` closure over a
//! reference" discipline the operator kernel already uses for predicates,
//! selectors and comparers (SPEC_FULL.md §10).

use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::operators::filter::DynamicFilter;
use crate::pipeline::ChangeSetSource;
use crate::reactive::{Observer, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

type MutationCallback = Arc<dyn Fn() + Send + Sync>;
type Unsubscribe = Box<dyn FnOnce() + Send>;
type SubscribeMutations<V> = Arc<dyn Fn(&V, MutationCallback) -> Unsubscribe + Send + Sync>;

/// Wraps a [`DynamicFilter`], subscribing to each in-collection item's
/// mutation stream and triggering [`DynamicFilter::reevaluate_key`] when
/// the selected property's value actually changes (not on every mutation
/// — unrelated property writes on the same item are not worth a
/// re-evaluate). Subscription discipline is strict: exactly one active
/// subscription per item-in-collection, established on Add/Update and
/// released on Remove or on operator disposal.
pub struct PropertyFilter<K, V, P> {
    inner: Arc<DynamicFilter<K, V>>,
    selector: Arc<dyn Fn(&V) -> P + Send + Sync>,
    subscribe_mutations: SubscribeMutations<V>,
    active: Mutex<HashMap<K, Unsubscribe>>,
    last_property: Mutex<HashMap<K, P>>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
    self_weak: Mutex<Weak<PropertyFilter<K, V, P>>>,
}

impl<K, V, P> PropertyFilter<K, V, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(
        upstream: Arc<dyn ChangeSetSource<K, V>>,
        predicate: impl Fn(&V) -> bool + Send + Sync + 'static,
        selector: impl Fn(&V) -> P + Send + Sync + 'static,
        subscribe_mutations: impl Fn(&V, MutationCallback) -> Unsubscribe + Send + Sync + 'static,
    ) -> Arc<Self> {
        let inner = DynamicFilter::new(upstream.clone(), predicate);
        let this = Arc::new(PropertyFilter {
            inner,
            selector: Arc::new(selector),
            subscribe_mutations: Arc::new(subscribe_mutations),
            active: Mutex::new(HashMap::new()),
            last_property: Mutex::new(HashMap::new()),
            upstream_subscription: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
        });
        *this.self_weak.lock() = Arc::downgrade(&this);
        let subscription = upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    fn subscribe_for(&self, key: K, value: &V) {
        let Some(strong_self) = self.self_weak.lock().upgrade() else { return };
        let key_for_callback = key.clone();
        let callback: MutationCallback = Arc::new(move || strong_self.on_property_maybe_changed(&key_for_callback));
        let unsubscribe = (self.subscribe_mutations)(value, callback);
        self.last_property.lock().insert(key.clone(), (self.selector)(value));
        if let Some(stale) = self.active.lock().insert(key, unsubscribe) {
            stale();
        }
    }

    fn unsubscribe_for(&self, key: &K) {
        if let Some(unsubscribe) = self.active.lock().remove(key) {
            unsubscribe();
        }
        self.last_property.lock().remove(key);
    }

    fn on_property_maybe_changed(&self, key: &K) {
        let Some(current_value) = self.inner.current(key) else { return };
        let new_property = (self.selector)(&current_value);
        let changed = {
            let mut last = self.last_property.lock();
            let changed = last.get(key) != Some(&new_property);
            if changed {
                last.insert(key.clone(), new_property);
            }
            changed
        };
        if changed {
            self.inner.reevaluate_key(key);
        }
    }
}

impl<K, V, P> Observer<ChangeSet<K, V>> for PropertyFilter<K, V, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        for record in upstream_set.records() {
            let key = record.key().clone();
            match record {
                Change::Add { current, .. } => self.subscribe_for(key, current),
                Change::Update { current, .. } => self.subscribe_for(key, current),
                Change::Remove { .. } => self.unsubscribe_for(&key),
                // Refresh/Moved never change identity or value (I4): the
                // existing subscription is still watching the right object.
                Change::Refresh { .. } | Change::Moved { .. } => {}
            }
        }
    }

    fn on_error(&self, _error: &Error) {
        // forwarded downstream by `inner`, which is independently
        // subscribed to the same upstream.
    }

    fn on_completed(&self) {}
}

impl<K, V, P> ChangeSetSource<K, V> for PropertyFilter<K, V, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    P: Clone + PartialEq + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.inner.connect(observer)
    }
}

impl<K, V, P> Drop for PropertyFilter<K, V, P> {
    fn drop(&mut self) {
        for (_, unsubscribe) in self.active.get_mut().drain() {
            unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::test_support::RecordingObserver;
    use parking_lot::Mutex as StdMutex;

    #[derive(Clone)]
    struct Watched {
        id: u32,
        balance: Arc<StdMutex<i64>>,
    }

    struct MutationHub {
        listeners: StdMutex<HashMap<u32, Vec<MutationCallback>>>,
    }

    impl MutationHub {
        fn new() -> Arc<Self> {
            Arc::new(MutationHub { listeners: StdMutex::new(HashMap::new()) })
        }

        fn fire(&self, id: u32) {
            if let Some(callbacks) = self.listeners.lock().get(&id) {
                for callback in callbacks {
                    callback();
                }
            }
        }
    }

    #[test]
    fn resubscribes_exactly_once_per_item_and_reevaluates_on_change() {
        let hub = MutationHub::new();
        let source = SourceCache::new(|w: &Watched| w.id);
        let balance_1 = Arc::new(StdMutex::new(50));
        source.add_or_update(Watched { id: 1, balance: balance_1.clone() });

        let hub_for_sub = hub.clone();
        let filter = PropertyFilter::new(
            source.clone(),
            |w: &Watched| *w.balance.lock() > 100,
            |w: &Watched| *w.balance.lock(),
            move |w: &Watched, callback| {
                let id = w.id;
                hub_for_sub.listeners.lock().entry(id).or_default().push(callback);
                let hub = hub_for_sub.clone();
                Box::new(move || {
                    hub.listeners.lock().remove(&id);
                })
            },
        );
        let recorder = RecordingObserver::new();
        let _sub = filter.connect(recorder.as_observer());
        assert_eq!(recorder.items().len(), 0); // no initial batch: nothing matches yet (I1)

        *balance_1.lock() = 150;
        hub.fire(1);
        assert_eq!(recorder.items().len(), 1);
        assert_eq!(recorder.items()[0].adds(), 1);

        // second fire with unchanged property must not re-evaluate.
        hub.fire(1);
        assert_eq!(recorder.items().len(), 1);

        source.remove(&1);
        assert_eq!(hub.listeners.lock().get(&1), None);
    }
}
