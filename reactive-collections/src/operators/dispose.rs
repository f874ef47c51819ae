//! Dispose-many (§3, "Lifecycle"; §8 scenario 5): a terminal stage that
//! invokes a user-supplied release hook exactly once per item leaving the
//! collection, whether it left via `Remove`, via being replaced on
//! `Update`/`Refresh` with a changed value, or via the upstream completing
//! (every still-held item is released).
//!
//! Grounded on the same "apply-then-forward" shape every operator in this
//! kernel uses, specialised to a sink that produces no change set of its
//! own — it is a leaf, like [`crate::bind::Binder`].

use crate::cache::materialized::MaterializedKeyedStage;
use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::pipeline::ChangeSetSource;
use crate::reactive::{Observer, Subscription};
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

/// Wraps an upstream keyed source, releasing each item's resources exactly
/// once when it departs the collection. Passes change sets through
/// unmodified — it is an observation point, not a transform.
pub struct DisposeMany<K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    release: Arc<dyn Fn(&K, &V) + Send + Sync>,
    stage: MaterializedKeyedStage<K, V>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V> DisposeMany<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, release: impl Fn(&K, &V) + Send + Sync + 'static) -> Arc<Self> {
        let this = Arc::new(DisposeMany { upstream, release: Arc::new(release), stage: MaterializedKeyedStage::new(), upstream_subscription: Mutex::new(None) });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    /// `Remove` releases the departing value; `Update` releases the
    /// superseded previous value (it is replaced, not mutated in place).
    /// `Refresh` never releases anything — I4 guarantees the value's
    /// identity is unchanged, which is exactly what distinguishes it from
    /// `Update` here.
    fn release_departed(&self, record: &Change<K, V>) {
        match record {
            Change::Remove { key, previous, .. } => (self.release)(key, previous),
            Change::Update { key, previous, .. } => (self.release)(key, previous),
            Change::Add { .. } | Change::Refresh { .. } | Change::Moved { .. } => {}
        }
    }
}

impl<K, V> Observer<ChangeSet<K, V>> for DisposeMany<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        for record in upstream_set.records() {
            self.release_departed(record);
        }
        self.stage.apply(upstream_set);
        tracing::trace!(total = upstream_set.total(), "dispose_many forwarded");
        self.stage.emit(upstream_set);
    }

    fn on_error(&self, error: &Error) {
        self.stage.on_error(error);
    }

    fn on_completed(&self) {
        for (key, value) in self.stage.snapshot() {
            (self.release)(&key, &value);
        }
        self.stage.on_completed();
    }
}

impl<K, V> ChangeSetSource<K, V> for DisposeMany<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.stage.connect(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::test_support::RecordingObserver;

    #[derive(Clone, Debug, PartialEq)]
    struct Wrapper {
        id: i32,
    }

    #[test]
    fn releases_exactly_once_per_departure() {
        let source = SourceCache::new(|w: &Wrapper| w.id);
        source.edit(|e| {
            e.add_or_update(Wrapper { id: 1 });
            e.add_or_update(Wrapper { id: 5 });
            e.add_or_update(Wrapper { id: 9 });
        });
        let released = Arc::new(Mutex::new(Vec::new()));
        let released_for_hook = released.clone();
        let disposing = DisposeMany::new(source.clone(), move |key, _value| released_for_hook.lock().push(*key));
        let recorder = RecordingObserver::new();
        let _sub = disposing.connect(recorder.as_observer());

        source.remove(&5);
        assert_eq!(*released.lock(), vec![5]);

        source.remove(&1);
        source.remove(&9);
        assert_eq!(released.lock().len(), 3);
    }

    #[test]
    fn completion_releases_every_remaining_item() {
        let source = SourceCache::new(|v: &i32| *v);
        source.add_or_update_many([1, 2, 3]);
        let released = Arc::new(Mutex::new(Vec::new()));
        let released_for_hook = released.clone();
        let disposing = DisposeMany::new(source.clone(), move |key, _value| released_for_hook.lock().push(*key));
        let recorder = RecordingObserver::new();
        let _sub = disposing.connect(recorder.as_observer());
        disposing.on_completed();
        let mut got = released.lock().clone();
        got.sort();
        assert_eq!(got, vec![1, 2, 3]);
    }
}
