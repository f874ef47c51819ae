//! Filter (§4.3.1): stateless and stateful (dynamic-predicate) forms over a
//! keyed change-set stream.

use crate::cache::materialized::MaterializedKeyedStage;
use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::pipeline::ChangeSetSource;
use crate::reactive::{Observer, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

type Predicate<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

/// Classifies one upstream record against `predicate` and `matched_before`
/// (whether the key was already present in our own mirror), per the table
/// in §4.3.1. Moves are not sort-aware here; they are folded into the same
/// present/absent transition as Update/Refresh.
fn classify<K: Clone, V: Clone>(record: &Change<K, V>, predicate: &dyn Fn(&V) -> bool, matched_before: bool) -> Option<Change<K, V>> {
    let key = record.key().clone();
    match record {
        Change::Add { current, .. } => predicate(current).then(|| Change::Add { key, current: current.clone(), current_index: None }),
        Change::Update { current, previous, .. } => {
            let matches_now = predicate(current);
            match (matches_now, matched_before) {
                (true, true) => Some(Change::Update { key, current: current.clone(), previous: previous.clone(), current_index: None, previous_index: None }),
                (true, false) => Some(Change::Add { key, current: current.clone(), current_index: None }),
                (false, true) => Some(Change::Remove { key, previous: previous.clone(), previous_index: None }),
                (false, false) => None,
            }
        }
        Change::Remove { previous, .. } => matched_before.then(|| Change::Remove { key, previous: previous.clone(), previous_index: None }),
        Change::Refresh { current, .. } => {
            let matches_now = predicate(current);
            match (matches_now, matched_before) {
                (true, true) => Some(Change::Refresh { key, current: current.clone(), current_index: None }),
                (true, false) => Some(Change::Add { key, current: current.clone(), current_index: None }),
                (false, true) => Some(Change::Remove { key, previous: current.clone(), previous_index: None }),
                (false, false) => None,
            }
        }
        Change::Moved { current, .. } => {
            let matches_now = predicate(current);
            match (matches_now, matched_before) {
                (true, true) => Some(Change::Refresh { key, current: current.clone(), current_index: None }),
                (true, false) => Some(Change::Add { key, current: current.clone(), current_index: None }),
                (false, true) => Some(Change::Remove { key, previous: current.clone(), previous_index: None }),
                (false, false) => None,
            }
        }
    }
}

/// The stateless form (§4.3.1): predicate is fixed for the lifetime of the
/// operator, so only the set of currently-matching keys needs to be
/// tracked — not the full upstream state.
pub struct Filter<K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    predicate: Predicate<V>,
    stage: MaterializedKeyedStage<K, V>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V> Filter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, predicate: impl Fn(&V) -> bool + Send + Sync + 'static) -> Arc<Self> {
        let this = Arc::new(Filter { upstream, predicate: Arc::new(predicate), stage: MaterializedKeyedStage::new(), upstream_subscription: Mutex::new(None) });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }
}

impl<K, V> Observer<ChangeSet<K, V>> for Filter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let mut records = Vec::new();
        for record in upstream_set.records() {
            let matched_before = self.stage.contains(record.key());
            if let Some(downstream) = classify(record, self.predicate.as_ref(), matched_before) {
                self.stage.apply(&ChangeSet::single(downstream.clone()));
                records.push(downstream);
            }
        }
        if let Some(change_set) = ChangeSet::from_records(records) {
            tracing::trace!(total = change_set.total(), "filter emitted");
            self.stage.emit(&change_set);
        }
    }

    fn on_error(&self, error: &Error) {
        self.stage.on_error(error);
    }

    fn on_completed(&self) {
        self.stage.on_completed();
    }
}

impl<K, V> ChangeSetSource<K, V> for Filter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.stage.connect(observer)
    }
}

/// The stateful form (§4.3.1): accepts predicate replacement and/or a bare
/// "re-evaluate" pulse. Since either can force a full reclassification it
/// keeps its own mirror of the complete upstream state, not just the
/// matched subset.
pub struct DynamicFilter<K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    predicate: Mutex<Predicate<V>>,
    upstream_mirror: Mutex<HashMap<K, V>>,
    stage: MaterializedKeyedStage<K, V>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V> DynamicFilter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, predicate: impl Fn(&V) -> bool + Send + Sync + 'static) -> Arc<Self> {
        let this = Arc::new(DynamicFilter {
            upstream,
            predicate: Mutex::new(Arc::new(predicate)),
            upstream_mirror: Mutex::new(HashMap::new()),
            stage: MaterializedKeyedStage::new(),
            upstream_subscription: Mutex::new(None),
        });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    /// Replaces the predicate and re-classifies every currently known
    /// upstream item, emitting the minimal transition set.
    pub fn set_predicate(&self, predicate: impl Fn(&V) -> bool + Send + Sync + 'static) {
        *self.predicate.lock() = Arc::new(predicate);
        self.reevaluate();
    }

    /// The current upstream value for `key`, if still live. Lets a stage
    /// layered on top (e.g. [`crate::operators::property_filter::PropertyFilter`])
    /// re-read an item's state without keeping its own duplicate mirror.
    pub fn current(&self, key: &K) -> Option<V> {
        self.upstream_mirror.lock().get(key).cloned()
    }

    /// Re-applies the current predicate to a single key without replacing
    /// it — for property-driven re-evaluate pulses scoped to one item
    /// (cheaper than [`Self::reevaluate`] when only one item's state
    /// actually changed).
    pub fn reevaluate_key(&self, key: &K) {
        let predicate = self.predicate.lock().clone();
        let mirror = self.upstream_mirror.lock();
        let Some(value) = mirror.get(key) else { return };
        let matches_now = predicate(value);
        let matched_before = self.stage.contains(key);
        let record = match (matches_now, matched_before) {
            (true, true) => None,
            (true, false) => Some(Change::Add { key: key.clone(), current: value.clone(), current_index: None }),
            (false, true) => Some(Change::Remove { key: key.clone(), previous: value.clone(), previous_index: None }),
            (false, false) => None,
        };
        drop(mirror);
        if let Some(record) = record {
            self.stage.apply(&ChangeSet::single(record.clone()));
            let change_set = ChangeSet::single(record);
            tracing::trace!(key_reevaluated = true, "filter re-evaluated one key");
            self.stage.emit(&change_set);
        }
    }

    /// Re-applies the current predicate to every item without replacing
    /// it — for property-driven re-evaluate pulses.
    pub fn reevaluate(&self) {
        let predicate = self.predicate.lock().clone();
        let mirror = self.upstream_mirror.lock();
        let mut records = Vec::new();
        for (key, value) in mirror.iter() {
            let matches_now = predicate(value);
            let matched_before = self.stage.contains(key);
            let record = match (matches_now, matched_before) {
                (true, true) => None,
                (true, false) => Some(Change::Add { key: key.clone(), current: value.clone(), current_index: None }),
                (false, true) => Some(Change::Remove { key: key.clone(), previous: value.clone(), previous_index: None }),
                (false, false) => None,
            };
            if let Some(record) = record {
                records.push(record);
            }
        }
        drop(mirror);
        for record in &records {
            self.stage.apply(&ChangeSet::single(record.clone()));
        }
        if let Some(change_set) = ChangeSet::from_records(records) {
            tracing::debug!(total = change_set.total(), "filter predicate changed");
            self.stage.emit(&change_set);
        }
    }
}

impl<K, V> Observer<ChangeSet<K, V>> for DynamicFilter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let predicate = self.predicate.lock().clone();
        let mut mirror = self.upstream_mirror.lock();
        let mut records = Vec::new();
        for record in upstream_set.records() {
            match record {
                Change::Remove { key, .. } => {
                    mirror.remove(key);
                }
                _ => {
                    if let Some(current) = record.current() {
                        mirror.insert(record.key().clone(), current.clone());
                    }
                }
            }
            let matched_before = self.stage.contains(record.key());
            if let Some(downstream) = classify(record, predicate.as_ref(), matched_before) {
                self.stage.apply(&ChangeSet::single(downstream.clone()));
                records.push(downstream);
            }
        }
        drop(mirror);
        if let Some(change_set) = ChangeSet::from_records(records) {
            self.stage.emit(&change_set);
        }
    }

    fn on_error(&self, error: &Error) {
        self.stage.on_error(error);
    }

    fn on_completed(&self) {
        self.stage.on_completed();
    }
}

impl<K, V> ChangeSetSource<K, V> for DynamicFilter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.stage.connect(observer)
    }
}

/// The list variant's reclassification policy (§4.3.1): `CalculateDiff`
/// computes an index-stable delta against the previous matching subset;
/// `ClearAndReplace` always emits a full `Clear`+`AddRange`, trading
/// incremental-update cost for simplicity when the predicate changes so
/// often that diffing is not worth it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ListFilterPolicy {
    CalculateDiff,
    ClearAndReplace,
}

/// The stateful form of filter over an indexed (list) stream (§4.3.1):
/// keeps the full upstream sequence so a predicate/re-evaluate change can
/// recompute the matching subsequence from scratch.
pub struct ListFilter<T> {
    upstream: Arc<dyn crate::pipeline::ListChangeSetSource<T>>,
    predicate: Mutex<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    policy: ListFilterPolicy,
    upstream_mirror: Mutex<Vec<T>>,
    matching: Mutex<Vec<T>>,
    stage: crate::list::materialized::MaterializedIndexedStage<T>,
    upstream_subscription: Mutex<Option<Subscription<crate::change::ListChangeSet<T>>>>,
}

impl<T> ListFilter<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    pub fn new(upstream: Arc<dyn crate::pipeline::ListChangeSetSource<T>>, predicate: impl Fn(&T) -> bool + Send + Sync + 'static, policy: ListFilterPolicy) -> Arc<Self> {
        let this = Arc::new(ListFilter {
            upstream,
            predicate: Mutex::new(Arc::new(predicate)),
            policy,
            upstream_mirror: Mutex::new(Vec::new()),
            matching: Mutex::new(Vec::new()),
            stage: crate::list::materialized::MaterializedIndexedStage::new(),
            upstream_subscription: Mutex::new(None),
        });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    pub fn set_predicate(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) {
        *self.predicate.lock() = Arc::new(predicate);
        self.reevaluate();
    }

    pub fn reevaluate(&self) {
        let predicate = self.predicate.lock().clone();
        let mirror = self.upstream_mirror.lock();
        let new_matching: Vec<T> = mirror.iter().filter(|item| predicate(item)).cloned().collect();
        drop(mirror);
        self.publish(new_matching);
    }

    fn publish(&self, new_matching: Vec<T>) {
        let mut matching = self.matching.lock();
        let change_set = match self.policy {
            ListFilterPolicy::ClearAndReplace => {
                let mut records = Vec::new();
                if !matching.is_empty() {
                    records.push(crate::change::ListChange::Clear { items: matching.clone() });
                }
                if !new_matching.is_empty() {
                    records.push(crate::change::ListChange::AddRange { index: 0, items: new_matching.clone() });
                }
                crate::change::ListChangeSet::from_records(records)
            }
            ListFilterPolicy::CalculateDiff => {
                let records = crate::operators::page::diff_positional(&matching, &new_matching);
                crate::change::ListChangeSet::from_records(records)
            }
        };
        *matching = new_matching;
        drop(matching);
        if let Some(change_set) = change_set {
            self.stage.apply(&change_set);
            tracing::debug!(total = change_set.total(), "list filter reclassified");
            self.stage.emit(&change_set);
        }
    }
}

impl<T> Observer<crate::change::ListChangeSet<T>> for ListFilter<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    fn on_next(&self, upstream_set: &crate::change::ListChangeSet<T>) {
        use crate::change::ListChange;
        let mut mirror = self.upstream_mirror.lock();
        for record in upstream_set.records() {
            match record {
                ListChange::Add { index, item } => mirror.insert(*index, item.clone()),
                ListChange::AddRange { index, items } => {
                    for (offset, item) in items.iter().enumerate() {
                        mirror.insert(index + offset, item.clone());
                    }
                }
                ListChange::Replace { index, current, .. } => mirror[*index] = current.clone(),
                ListChange::Remove { index, .. } => {
                    mirror.remove(*index);
                }
                ListChange::RemoveRange { index, items } => {
                    mirror.drain(*index..*index + items.len());
                }
                ListChange::Moved { previous_index, current_index, item } => {
                    mirror.remove(*previous_index);
                    mirror.insert(*current_index, item.clone());
                }
                ListChange::Refresh { index, item } => mirror[*index] = item.clone(),
                ListChange::Clear { .. } => mirror.clear(),
            }
        }
        let predicate = self.predicate.lock().clone();
        let new_matching: Vec<T> = mirror.iter().filter(|item| predicate(item)).cloned().collect();
        drop(mirror);
        self.publish(new_matching);
    }

    fn on_error(&self, error: &Error) {
        self.stage.on_error(error);
    }

    fn on_completed(&self) {
        self.stage.on_completed();
    }
}

impl<T> crate::pipeline::ListChangeSetSource<T> for ListFilter<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<crate::change::ListChangeSet<T>>>) -> Subscription<crate::change::ListChangeSet<T>> {
        self.stage.connect(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::test_support::RecordingObserver;

    #[derive(Clone, Debug, PartialEq)]
    struct Person {
        name: &'static str,
        age: u32,
    }

    #[test]
    fn age_over_18_scenario() {
        let source = SourceCache::new(|p: &Person| p.name);
        source.edit(|e| {
            e.add_or_update(Person { name: "A", age: 17 });
            e.add_or_update(Person { name: "B", age: 20 });
            e.add_or_update(Person { name: "C", age: 25 });
        });
        let filtered = Filter::new(source.clone(), |p: &Person| p.age > 18);
        let recorder = RecordingObserver::new();
        let _sub = filtered.connect(recorder.as_observer());

        let initial = &recorder.items()[0];
        assert_eq!(initial.adds(), 2);

        source.add_or_update(Person { name: "A", age: 30 });
        let batch = recorder.items()[1].clone();
        assert_eq!(batch.adds(), 1);

        source.add_or_update(Person { name: "B", age: 10 });
        let batch = recorder.items()[2].clone();
        assert_eq!(batch.removes(), 1);

        source.refresh(&"A");
        let batch = recorder.items()[3].clone();
        assert_eq!(batch.refreshes(), 1);
    }

    #[test]
    fn predicate_change_reclassifies_everything() {
        let source = SourceCache::new(|p: &Person| p.name);
        source.add_or_update(Person { name: "A", age: 10 });
        source.add_or_update(Person { name: "B", age: 20 });
        let filtered = DynamicFilter::new(source.clone(), |p: &Person| p.age > 18);
        let recorder = RecordingObserver::new();
        let _sub = filtered.connect(recorder.as_observer());
        assert_eq!(recorder.items()[0].adds(), 1); // only B

        filtered.set_predicate(|p: &Person| p.age < 18);
        let batch = &recorder.items()[1];
        assert_eq!(batch.adds(), 1); // A now matches
        assert_eq!(batch.removes(), 1); // B no longer matches
    }

    #[test]
    fn list_filter_calculate_diff_reclassifies_in_place() {
        use crate::list::SourceList;
        let source = SourceList::<i32>::new();
        source.add_range(vec![1, 2, 3, 4, 5], None);
        let filtered = ListFilter::new(source.clone(), |v: &i32| *v % 2 == 0, ListFilterPolicy::CalculateDiff);
        let recorder = RecordingObserver::new();
        let _sub = filtered.connect(recorder.as_observer());
        assert_eq!(recorder.items()[0].total(), 2); // 2, 4

        filtered.set_predicate(|v: &i32| *v % 2 == 1);
        let batch = recorder.items().last().unwrap().clone();
        // odds {1,3,5} replace evens {2,4}: net change is a mix of adds/removes.
        assert!(batch.total() > 0);
        assert_eq!(filtered.matching.lock().len(), 3);
    }

    #[test]
    fn list_filter_clear_and_replace_emits_full_reset() {
        use crate::list::SourceList;
        let source = SourceList::<i32>::new();
        source.add_range(vec![1, 2, 3], None);
        let filtered = ListFilter::new(source.clone(), |v: &i32| *v > 1, ListFilterPolicy::ClearAndReplace);
        let recorder = RecordingObserver::new();
        let _sub = filtered.connect(recorder.as_observer());
        filtered.set_predicate(|v: &i32| *v > 2);
        let batch = recorder.items().last().unwrap().clone();
        assert_eq!(batch.records().len(), 2); // one Clear, one AddRange
    }
}
