//! Group (§4.3.4): partitions a keyed stream by `V -> G`, emitting a change
//! set of *groups*, each exposing its own inner change-set stream.

use crate::cache::materialized::MaterializedKeyedStage;
use crate::change::{Change, ChangeReason, ChangeSet};
use crate::error::Error;
use crate::pipeline::ChangeSetSource;
use crate::reactive::{Observer, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// One partition of a [`Group`]'s output: the group key plus a private
/// change-aware mirror (C2) of its members.
pub struct GroupBucket<G, K, V> {
    group_key: G,
    stage: MaterializedKeyedStage<K, V>,
}

impl<G, K, V> GroupBucket<G, K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new(group_key: G) -> Self {
        GroupBucket { group_key, stage: MaterializedKeyedStage::new() }
    }

    pub fn key(&self) -> &G {
        &self.group_key
    }

    pub fn items(&self) -> Vec<(K, V)> {
        self.stage.snapshot()
    }

    pub fn count(&self) -> usize {
        self.stage.len()
    }

    fn apply_and_emit(&self, record: Change<K, V>) {
        let change_set = ChangeSet::single(record);
        self.stage.apply(&change_set);
        self.stage.emit(&change_set);
    }
}

impl<G, K, V> ChangeSetSource<K, V> for GroupBucket<G, K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.stage.connect(observer)
    }
}

pub struct Group<G, K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    group_key: Arc<dyn Fn(&V) -> G + Send + Sync>,
    item_group: Mutex<HashMap<K, G>>,
    buckets: Mutex<HashMap<G, Arc<GroupBucket<G, K, V>>>>,
    outer: MaterializedKeyedStage<G, Arc<GroupBucket<G, K, V>>>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<G, K, V> Group<G, K, V>
where
    G: Eq + Hash + Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, group_key: impl Fn(&V) -> G + Send + Sync + 'static) -> Arc<Self> {
        let this = Arc::new(Group {
            upstream,
            group_key: Arc::new(group_key),
            item_group: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            outer: MaterializedKeyedStage::new(),
            upstream_subscription: Mutex::new(None),
        });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    /// A specialised constructor for group keys that never change once an
    /// item is added. The general algorithm below already takes the cheap
    /// in-place path whenever the recomputed key matches the prior one, so
    /// this is a documentation-level alias rather than a distinct
    /// implementation (SPEC_FULL.md §10).
    pub fn new_on_immutable_key(upstream: Arc<dyn ChangeSetSource<K, V>>, group_key: impl Fn(&V) -> G + Send + Sync + 'static) -> Arc<Self> {
        Self::new(upstream, group_key)
    }
}

impl<G, K, V> Observer<ChangeSet<K, V>> for Group<G, K, V>
where
    G: Eq + Hash + Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let group_key_of = self.group_key.clone();
        let mut item_group = self.item_group.lock();
        let mut buckets = self.buckets.lock();
        let mut outer_records = Vec::new();

        let get_or_create_bucket = |g: &G, buckets: &mut HashMap<G, Arc<GroupBucket<G, K, V>>>, outer_records: &mut Vec<Change<G, Arc<GroupBucket<G, K, V>>>>| -> Arc<GroupBucket<G, K, V>> {
            if let Some(bucket) = buckets.get(g) {
                return bucket.clone();
            }
            let bucket = Arc::new(GroupBucket::new(g.clone()));
            outer_records.push(Change::Add { key: g.clone(), current: bucket.clone(), current_index: None });
            buckets.insert(g.clone(), bucket.clone());
            bucket
        };

        for record in upstream_set.records() {
            let key = record.key().clone();
            match record {
                Change::Remove { previous, .. } => {
                    if let Some(old_group) = item_group.remove(&key) {
                        let empty_after = if let Some(bucket) = buckets.get(&old_group) {
                            bucket.apply_and_emit(Change::Remove { key: key.clone(), previous: previous.clone(), previous_index: None });
                            bucket.count() == 0
                        } else {
                            false
                        };
                        if empty_after {
                            if let Some(removed) = buckets.remove(&old_group) {
                                outer_records.push(Change::Remove { key: old_group, previous: removed, previous_index: None });
                            }
                        }
                    }
                }
                _ => {
                    let current = record.current().expect("non-Remove records always carry a current value").clone();
                    let new_group = group_key_of(&current);
                    let old_group = item_group.get(&key).cloned();

                    match old_group {
                        None => {
                            let bucket = get_or_create_bucket(&new_group, &mut buckets, &mut outer_records);
                            bucket.apply_and_emit(Change::Add { key: key.clone(), current, current_index: None });
                            item_group.insert(key, new_group);
                        }
                        Some(old_group) if old_group == new_group => {
                            let bucket = buckets.get(&old_group).expect("tracked group always has a live bucket").clone();
                            let inner = if record.reason() == ChangeReason::Refresh {
                                Change::Refresh { key: key.clone(), current, current_index: None }
                            } else {
                                let previous = bucket.stage.get(&key).expect("bucket mirrors every item assigned to it");
                                Change::Update { key: key.clone(), current, previous, current_index: None, previous_index: None }
                            };
                            bucket.apply_and_emit(inner);
                        }
                        Some(old_group) => {
                            if let Some(old_bucket) = buckets.get(&old_group).cloned() {
                                if let Some(previous) = old_bucket.stage.get(&key) {
                                    old_bucket.apply_and_emit(Change::Remove { key: key.clone(), previous, previous_index: None });
                                }
                                if old_bucket.count() == 0 {
                                    buckets.remove(&old_group);
                                    outer_records.push(Change::Remove { key: old_group, previous: old_bucket, previous_index: None });
                                }
                            }
                            let new_bucket = get_or_create_bucket(&new_group, &mut buckets, &mut outer_records);
                            new_bucket.apply_and_emit(Change::Add { key: key.clone(), current, current_index: None });
                            item_group.insert(key, new_group);
                        }
                    }
                }
            }
        }

        drop(buckets);
        drop(item_group);
        for record in &outer_records {
            self.outer.apply(&ChangeSet::single(record.clone()));
        }
        if let Some(change_set) = ChangeSet::from_records(outer_records) {
            tracing::trace!(total = change_set.total(), "group emitted");
            self.outer.emit(&change_set);
        }
    }

    fn on_error(&self, error: &Error) {
        self.outer.on_error(error);
    }

    fn on_completed(&self) {
        self.outer.on_completed();
    }
}

impl<G, K, V> ChangeSetSource<G, Arc<GroupBucket<G, K, V>>> for Group<G, K, V>
where
    G: Eq + Hash + Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<G, Arc<GroupBucket<G, K, V>>>>>) -> Subscription<ChangeSet<G, Arc<GroupBucket<G, K, V>>>> {
        self.outer.connect(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::test_support::RecordingObserver;

    #[derive(Clone, Debug, PartialEq)]
    enum Status {
        Live,
        Filled,
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Trade {
        id: u32,
        status: Status,
    }

    #[test]
    fn trades_by_status_scenario() {
        let source = SourceCache::new(|t: &Trade| t.id);
        source.edit(|e| {
            e.add_or_update(Trade { id: 1, status: Status::Live });
            e.add_or_update(Trade { id: 2, status: Status::Filled });
            e.add_or_update(Trade { id: 3, status: Status::Live });
            e.add_or_update(Trade { id: 4, status: Status::Filled });
        });
        let grouped = Group::new(source.clone(), |t: &Trade| t.status.clone());
        let outer_recorder = RecordingObserver::new();
        let _sub = grouped.connect(outer_recorder.as_observer());
        assert_eq!(outer_recorder.items()[0].adds(), 2); // Live, Filled

        let live_bucket = grouped.buckets.lock().get(&Status::Live).unwrap().clone();
        assert_eq!(live_bucket.count(), 2);

        source.add_or_update(Trade { id: 1, status: Status::Filled });
        assert_eq!(live_bucket.count(), 1);

        source.remove(&3);
        assert_eq!(live_bucket.count(), 0);
        let last_outer = outer_recorder.items().last().unwrap().clone();
        assert_eq!(last_outer.removes(), 1); // Live group itself removed (empty)
    }
}
