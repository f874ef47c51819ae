//! Sort (§4.3.3): maintains an ordered index over a comparator plus a keyed
//! mirror, emitting [`SortedChangeSet`] so downstream paging/binding stages
//! always have the full ordered view alongside the delta.

use crate::change::{Change, ChangeSet, SortReason, SortedChangeSet};
use crate::error::Error;
use crate::pipeline::{ChangeSetSource, SortedChangeSetSource};
use crate::reactive::{Observer, Subject, Subscription};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

type Comparator<V> = Arc<dyn Fn(&V, &V) -> Ordering + Send + Sync>;

struct SortState<K, V> {
    mirror: HashMap<K, V>,
    order: Vec<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> SortState<K, V> {
    fn sorted_view(&self) -> Vec<(K, V)> {
        self.order.iter().map(|k| (k.clone(), self.mirror.get(k).cloned().expect("order only ever names live keys"))).collect()
    }

    fn insertion_index(&self, value: &V, comparator: &(dyn Fn(&V, &V) -> Ordering + Send + Sync)) -> usize {
        self.order.partition_point(|k| comparator(self.mirror.get(k).expect("order only ever names live keys"), value) != Ordering::Greater)
    }
}

/// A reset-threshold of `-1` means "never reset" (always incremental); `0`
/// means "always reset" (see SPEC_FULL.md §10's Open Question resolution).
pub const NEVER_RESET: i64 = -1;
pub const ALWAYS_RESET: i64 = 0;

pub struct Sort<K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    comparator: Mutex<Comparator<V>>,
    reset_threshold: i64,
    treat_moves_as_remove_add: bool,
    state: Mutex<SortState<K, V>>,
    subject: Subject<SortedChangeSet<K, V>>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V> Sort<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, comparator: impl Fn(&V, &V) -> Ordering + Send + Sync + 'static, reset_threshold: i64, treat_moves_as_remove_add: bool) -> Arc<Self> {
        let this = Arc::new(Sort {
            upstream,
            comparator: Mutex::new(Arc::new(comparator)),
            reset_threshold,
            treat_moves_as_remove_add,
            state: Mutex::new(SortState { mirror: HashMap::new(), order: Vec::new() }),
            subject: Subject::new(),
            upstream_subscription: Mutex::new(None),
        });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    fn over_threshold(&self, touched: usize) -> bool {
        self.reset_threshold != NEVER_RESET && (touched as i64) > self.reset_threshold
    }

    fn emit_snapshot(&self, reason: SortReason) {
        let state = self.state.lock();
        let sorted_view = state.sorted_view();
        let records: Vec<Change<K, V>> = sorted_view.iter().enumerate().map(|(i, (k, v))| Change::Add { key: k.clone(), current: v.clone(), current_index: Some(i) }).collect();
        drop(state);
        if let Some(change_set) = ChangeSet::from_records(records) {
            let sorted = SortedChangeSet::new(change_set, sorted_view, reason);
            tracing::debug!(total = sorted.total(), ?reason, "sort emitted full snapshot");
            self.subject.on_next(&sorted);
        }
    }

    /// Replaces the comparator and recomputes the entire order (§4.3.3,
    /// "comparator change"). Emits `sort_reason = ComparerChanged`.
    pub fn set_comparator(&self, comparator: impl Fn(&V, &V) -> Ordering + Send + Sync + 'static) {
        *self.comparator.lock() = Arc::new(comparator);
        let comparator = self.comparator.lock().clone();
        let mut state = self.state.lock();
        let previous_positions: HashMap<K, usize> = state.order.iter().cloned().enumerate().map(|(i, k)| (k, i)).collect();
        let mut new_order = state.order.clone();
        new_order.sort_by(|a, b| comparator(state.mirror.get(a).unwrap(), state.mirror.get(b).unwrap()));
        state.order = new_order;
        let mut records = Vec::new();
        for (new_index, key) in state.order.iter().enumerate() {
            let old_index = previous_positions[key];
            if old_index != new_index {
                let value = state.mirror.get(key).cloned().expect("order only ever names live keys");
                records.push(Change::Moved { key: key.clone(), current: value, previous_index: old_index, current_index: new_index });
            }
        }
        let sorted_view = state.sorted_view();
        drop(state);
        if let Some(change_set) = ChangeSet::from_records(records) {
            let sorted = SortedChangeSet::new(change_set, sorted_view, SortReason::ComparerChanged);
            tracing::debug!(total = sorted.total(), "sort comparator changed");
            self.subject.on_next(&sorted);
        }
    }
}

impl<K, V> Observer<ChangeSet<K, V>> for Sort<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        if self.over_threshold(upstream_set.total()) {
            let comparator = self.comparator.lock().clone();
            let mut state = self.state.lock();
            let is_initial_load = state.order.is_empty();
            for record in upstream_set.records() {
                match record {
                    Change::Remove { key, .. } => {
                        state.mirror.remove(key);
                        state.order.retain(|k| k != key);
                    }
                    _ => {
                        let current = record.current().expect("non-Remove records always carry a current value").clone();
                        let key = record.key().clone();
                        state.order.retain(|k| k != &key);
                        state.mirror.insert(key.clone(), current);
                        let index = state.insertion_index(state.mirror.get(&key).unwrap(), comparator.as_ref());
                        state.order.insert(index, key);
                    }
                }
            }
            drop(state);
            // A fresh population is always reported as the initial load, even
            // past the reset-threshold — only a later, already-populated
            // batch collapses into a `Reset` (§8 scenario 2).
            self.emit_snapshot(if is_initial_load { SortReason::InitialLoad } else { SortReason::Reset });
            return;
        }

        let comparator = self.comparator.lock().clone();
        let mut state = self.state.lock();
        let mut records = Vec::new();

        for record in upstream_set.records() {
            let key = record.key().clone();
            match record {
                Change::Remove { .. } => {
                    if let Some(previous_index) = state.order.iter().position(|k| k == &key) {
                        state.order.remove(previous_index);
                        state.mirror.remove(&key);
                        records.push(Change::Remove { key, previous: record.previous().unwrap().clone(), previous_index: Some(previous_index) });
                    }
                }
                Change::Add { current, .. } => {
                    let index = state.insertion_index(current, comparator.as_ref());
                    state.order.insert(index, key.clone());
                    state.mirror.insert(key.clone(), current.clone());
                    records.push(Change::Add { key, current: current.clone(), current_index: Some(index) });
                }
                Change::Update { current, .. } | Change::Refresh { current, .. } | Change::Moved { current, .. } => {
                    let previous_index = state.order.iter().position(|k| k == &key);
                    if let Some(previous_index) = previous_index {
                        state.order.remove(previous_index);
                    }
                    let new_index = state.insertion_index(current, comparator.as_ref());
                    state.order.insert(new_index, key.clone());
                    state.mirror.insert(key.clone(), current.clone());

                    match (previous_index, record.reason()) {
                        (Some(previous_index), _) if previous_index == new_index => {
                            records.push(match record {
                                Change::Update { previous, .. } => Change::Update { key, current: current.clone(), previous: previous.clone(), current_index: Some(new_index), previous_index: Some(previous_index) },
                                _ => Change::Refresh { key, current: current.clone(), current_index: Some(new_index) },
                            });
                        }
                        (Some(previous_index), _) if self.treat_moves_as_remove_add => {
                            records.push(Change::Remove { key: key.clone(), previous: current.clone(), previous_index: Some(previous_index) });
                            records.push(Change::Add { key, current: current.clone(), current_index: Some(new_index) });
                        }
                        (Some(previous_index), _) => {
                            records.push(Change::Moved { key, current: current.clone(), previous_index, current_index: new_index });
                        }
                        (None, _) => {
                            records.push(Change::Add { key, current: current.clone(), current_index: Some(new_index) });
                        }
                    }
                }
            }
        }

        let sorted_view = state.sorted_view();
        drop(state);
        if let Some(change_set) = ChangeSet::from_records(records) {
            let reason = if sorted_view.len() == change_set.total() && change_set.removes() == 0 { SortReason::InitialLoad } else { SortReason::DataChanged };
            let sorted = SortedChangeSet::new(change_set, sorted_view, reason);
            tracing::trace!(total = sorted.total(), "sort emitted");
            self.subject.on_next(&sorted);
        }
    }

    fn on_error(&self, error: &Error) {
        self.subject.on_error(error);
    }

    fn on_completed(&self) {
        self.subject.on_completed();
    }
}

impl<K, V> SortedChangeSetSource<K, V> for Sort<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<SortedChangeSet<K, V>>>) -> Subscription<SortedChangeSet<K, V>> {
        let state = self.state.lock();
        let sorted_view = state.sorted_view();
        drop(state);
        if !sorted_view.is_empty() {
            let records: Vec<Change<K, V>> = sorted_view.iter().enumerate().map(|(i, (k, v))| Change::Add { key: k.clone(), current: v.clone(), current_index: Some(i) }).collect();
            let change_set = ChangeSet::from_records(records).expect("non-empty sorted view produces at least one record");
            observer.on_next(&SortedChangeSet::new(change_set, sorted_view, SortReason::InitialLoad));
        }
        self.subject.subscribe(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use parking_lot::Mutex as StdMutex;

    struct Collector(StdMutex<Vec<SortedChangeSet<u32, u32>>>);

    impl Observer<SortedChangeSet<u32, u32>> for Collector {
        fn on_next(&self, item: &SortedChangeSet<u32, u32>) {
            self.0.lock().push(item.clone());
        }
        fn on_error(&self, _error: &Error) {}
        fn on_completed(&self) {}
    }

    #[test]
    fn ascending_then_comparator_change() {
        let source = SourceCache::new(|v: &u32| *v);
        for age in [20u32, 5, 15, 30, 1] {
            source.add_or_update(age);
        }
        let sorted = Sort::new(source.clone(), |a: &u32, b: &u32| a.cmp(b), NEVER_RESET, false);
        let collector = Arc::new(Collector(StdMutex::new(Vec::new())));
        let _sub = sorted.connect(collector.clone());
        let initial = collector.0.lock()[0].clone();
        assert_eq!(initial.sort_reason, SortReason::InitialLoad);
        assert_eq!(initial.sorted_view.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![1, 5, 15, 20, 30]);

        sorted.set_comparator(|a: &u32, b: &u32| b.cmp(a));
        let after = collector.0.lock().last().unwrap().clone();
        assert_eq!(after.sort_reason, SortReason::ComparerChanged);
        assert_eq!(after.sorted_view.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![30, 20, 15, 5, 1]);
    }
}
