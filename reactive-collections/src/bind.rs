//! The binding adapter (C7, §4.4): drives an external "observable
//! collection" target from a sorted change-set stream, under a
//! reset-threshold policy that trades many small notifications for one
//! full reload once a batch gets large enough.
//!
//! The target is named only by the interface §4.4 requires of it
//! (`insert`/`remove_at`/`move`/`replace`/`clear`/`add_range`/
//! `suppress_notifications`) — concrete UI binding targets are out of
//! scope (§1's Non-goals) — so [`BindTarget`] is the seam, mirrored the
//! way [`crate::operators::property_filter::PropertyFilter`] takes a
//! `subscribe_mutations` capability instead of requiring a concrete
//! notify-on-change trait.

use crate::change::{Change, SortReason, SortedChangeSet};
use crate::error::{BindError, Error};
use crate::pipeline::SortedChangeSetSource;
use crate::reactive::{Observer, Subject, Subscription};
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

/// A mutable, externally observable sequence the adapter drives (§4.4).
/// `suppress_notifications` returns a thunk that re-enables notifications
/// when called — the "scoped suppression" the spec describes, expressed
/// as a capability closure rather than a guard type so the target decides
/// what re-enabling actually means.
pub trait BindTarget<V>: Send + Sync {
    fn insert(&self, index: usize, item: V) -> crate::Result<()>;
    fn remove_at(&self, index: usize) -> crate::Result<()>;
    fn move_item(&self, from: usize, to: usize) -> crate::Result<()>;
    fn replace(&self, index: usize, item: V) -> crate::Result<()>;
    fn clear(&self) -> crate::Result<()>;
    fn add_range(&self, items: Vec<V>) -> crate::Result<()>;
    fn suppress_notifications(&self) -> Box<dyn FnOnce() + Send>;
}

/// A reset-threshold of `-1` means "never reset" (always incremental); `0`
/// means "always reset" — the same convention
/// [`crate::operators::sort::NEVER_RESET`]/[`crate::operators::sort::ALWAYS_RESET`]
/// use.
pub const NEVER_RESET: i64 = crate::operators::sort::NEVER_RESET;
pub const ALWAYS_RESET: i64 = crate::operators::sort::ALWAYS_RESET;

/// Applies a [`SortedChangeSet`] stream to a [`BindTarget`] so the target
/// equals the sorted view after every emission (I5).
pub struct Binder<K, V> {
    upstream: Arc<dyn SortedChangeSetSource<K, V>>,
    target: Arc<dyn BindTarget<V>>,
    reset_threshold: i64,
    status: Subject<()>,
    upstream_subscription: Mutex<Option<Subscription<SortedChangeSet<K, V>>>>,
}

impl<K, V> Binder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn SortedChangeSetSource<K, V>>, target: Arc<dyn BindTarget<V>>, reset_threshold: i64) -> Arc<Self> {
        let this = Arc::new(Binder { upstream, target, reset_threshold, status: Subject::new(), upstream_subscription: Mutex::new(None) });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    /// Subscribes to completion/error notifications only — the binder has
    /// nothing further to emit downstream (it is terminal, §4.4), but a
    /// caller may still want to know the target rejected an operation.
    pub fn subscribe_status(&self, observer: Arc<dyn Observer<()>>) -> Subscription<()> {
        self.status.subscribe(observer)
    }

    fn over_threshold(&self, touched: usize) -> bool {
        self.reset_threshold != NEVER_RESET && (touched as i64) > self.reset_threshold
    }

    fn should_reset(&self, sorted_set: &SortedChangeSet<K, V>) -> bool {
        matches!(sorted_set.sort_reason, SortReason::InitialLoad | SortReason::ComparerChanged | SortReason::Reset) || self.over_threshold(sorted_set.total())
    }

    fn apply_reset(&self, sorted_set: &SortedChangeSet<K, V>) -> crate::Result<()> {
        let release = self.target.suppress_notifications();
        let result = (|| {
            self.target.clear()?;
            let items: Vec<V> = sorted_set.sorted_view.iter().map(|(_, v)| v.clone()).collect();
            if !items.is_empty() {
                self.target.add_range(items)?;
            }
            Ok(())
        })();
        release();
        result
    }

    fn apply_incremental(&self, sorted_set: &SortedChangeSet<K, V>) -> crate::Result<()> {
        for record in sorted_set.change_set.records() {
            match record {
                Change::Add { current, current_index, .. } => {
                    let index = current_index.ok_or_else(|| BindError::Target("Add record missing current_index for a sorted stream".into()))?;
                    self.target.insert(index, current.clone())?;
                }
                Change::Remove { previous_index, .. } => {
                    let index = previous_index.ok_or_else(|| BindError::Target("Remove record missing previous_index for a sorted stream".into()))?;
                    self.target.remove_at(index)?;
                }
                Change::Moved { previous_index, current_index, .. } => {
                    self.target.move_item(*previous_index, *current_index)?;
                }
                Change::Update { current, current_index, previous_index, .. } => match (previous_index, current_index) {
                    (Some(from), Some(to)) if from == to => {
                        self.target.replace(*to, current.clone())?;
                    }
                    (Some(from), Some(to)) => {
                        self.target.remove_at(*from)?;
                        self.target.insert(*to, current.clone())?;
                    }
                    (None, Some(to)) => self.target.insert(*to, current.clone())?,
                    (Some(from), None) => self.target.remove_at(*from)?,
                    (None, None) => return Err(BindError::Target("Update record missing both indices for a sorted stream".into()).into()),
                },
                Change::Refresh { current, current_index, .. } => {
                    let index = current_index.ok_or_else(|| BindError::Target("Refresh record missing current_index for a sorted stream".into()))?;
                    self.target.replace(index, current.clone())?;
                }
            }
        }
        Ok(())
    }
}

impl<K, V> Observer<SortedChangeSet<K, V>> for Binder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, sorted_set: &SortedChangeSet<K, V>) {
        let result = if self.should_reset(sorted_set) {
            tracing::debug!(total = sorted_set.total(), sort_reason = ?sorted_set.sort_reason, "binder applying full reset");
            self.apply_reset(sorted_set)
        } else {
            tracing::trace!(total = sorted_set.total(), "binder applying incremental ops");
            self.apply_incremental(sorted_set)
        };
        if let Err(error) = result {
            self.status.on_error(&error);
        }
    }

    fn on_error(&self, error: &Error) {
        self.status.on_error(error);
    }

    fn on_completed(&self) {
        self.status.on_completed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::operators::sort::Sort;
    use parking_lot::Mutex as StdMutex;

    struct VecTarget(StdMutex<Vec<u32>>);

    impl VecTarget {
        fn new() -> Arc<Self> {
            Arc::new(VecTarget(StdMutex::new(Vec::new())))
        }

        fn snapshot(&self) -> Vec<u32> {
            self.0.lock().clone()
        }
    }

    impl BindTarget<u32> for VecTarget {
        fn insert(&self, index: usize, item: u32) -> crate::Result<()> {
            self.0.lock().insert(index, item);
            Ok(())
        }
        fn remove_at(&self, index: usize) -> crate::Result<()> {
            self.0.lock().remove(index);
            Ok(())
        }
        fn move_item(&self, from: usize, to: usize) -> crate::Result<()> {
            let item = self.0.lock().remove(from);
            self.0.lock().insert(to, item);
            Ok(())
        }
        fn replace(&self, index: usize, item: u32) -> crate::Result<()> {
            self.0.lock()[index] = item;
            Ok(())
        }
        fn clear(&self) -> crate::Result<()> {
            self.0.lock().clear();
            Ok(())
        }
        fn add_range(&self, items: Vec<u32>) -> crate::Result<()> {
            self.0.lock().extend(items);
            Ok(())
        }
        fn suppress_notifications(&self) -> Box<dyn FnOnce() + Send> {
            Box::new(|| {})
        }
    }

    #[test]
    fn initial_load_resets_target_to_sorted_view() {
        let source = SourceCache::new(|v: &u32| *v);
        source.add_or_update_many([5, 1, 3]);
        let sorted = Sort::new(source.clone(), |a: &u32, b: &u32| a.cmp(b), crate::operators::sort::NEVER_RESET, false);
        let target = VecTarget::new();
        let _binder = Binder::new(sorted.clone(), target.clone(), NEVER_RESET);
        assert_eq!(target.snapshot(), vec![1, 3, 5]);
    }

    #[test]
    fn incremental_insert_keeps_target_equal_to_sorted_view() {
        let source = SourceCache::new(|v: &u32| *v);
        source.add_or_update_many([1, 3, 5]);
        let sorted = Sort::new(source.clone(), |a: &u32, b: &u32| a.cmp(b), crate::operators::sort::NEVER_RESET, false);
        let target = VecTarget::new();
        let _binder = Binder::new(sorted.clone(), target.clone(), NEVER_RESET);
        source.add_or_update(2);
        assert_eq!(target.snapshot(), vec![1, 2, 3, 5]);
        source.remove(&3);
        assert_eq!(target.snapshot(), vec![1, 2, 5]);
    }

    #[test]
    fn large_batch_over_threshold_triggers_single_reset() {
        let source = SourceCache::new(|v: &u32| *v);
        let sorted = Sort::new(source.clone(), |a: &u32, b: &u32| a.cmp(b), crate::operators::sort::NEVER_RESET, false);
        let target = VecTarget::new();
        let _binder = Binder::new(sorted.clone(), target.clone(), 2);
        source.add_or_update_many(0..10); // touches 10 > threshold 2 in one batch
        assert_eq!(target.snapshot(), (0..10).collect::<Vec<_>>());
    }
}
