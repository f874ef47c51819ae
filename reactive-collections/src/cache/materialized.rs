use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::reactive::{Observer, Subject, Subscription};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// C2 — the change-aware cache: a keyed mirror of "what I have already
/// published downstream" plus the subject that publishes it.
///
/// Every keyed operator (filter, transform, distinct, group, join,
/// combinators) and [`crate::cache::SourceCache`] itself embed one of
/// these instead of rolling their own `HashMap` + subscriber list. On
/// first subscription it replays the current mirror as a single `Add`
/// batch (I2); after that it forwards whatever change set its owner
/// computed.
pub struct MaterializedKeyedStage<K, V> {
    state: RwLock<HashMap<K, V>>,
    subject: Subject<ChangeSet<K, V>>,
}

impl<K, V> Default for MaterializedKeyedStage<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        MaterializedKeyedStage { state: RwLock::new(HashMap::new()), subject: Subject::new() }
    }
}

impl<K, V> MaterializedKeyedStage<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct write access to the mirror, for owners (the source cache)
    /// that mutate it item-by-item while building their own change set.
    /// Operators should prefer [`Self::apply`].
    pub(crate) fn raw_write(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.state.write()
    }

    /// Subscribes without replaying the initial batch. Used by stages that
    /// perform their own, narrower replay (e.g. [`crate::cache::SourceCache::watch`]
    /// replays only one key's state).
    pub(crate) fn subscribe_raw(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.subject.subscribe(observer)
    }

    pub fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        let initial: Vec<Change<K, V>> = {
            let guard = self.state.read();
            guard.iter().map(|(k, v)| Change::Add { key: k.clone(), current: v.clone(), current_index: None }).collect()
        };
        if let Some(initial) = ChangeSet::from_records(initial) {
            observer.on_next(&initial);
        }
        self.subject.subscribe(observer)
    }

    /// Applies `change_set` to the mirror (Add/Update/Refresh/Moved write
    /// the current value, Remove deletes the key).
    pub fn apply(&self, change_set: &ChangeSet<K, V>) {
        let mut guard = self.state.write();
        for record in change_set.records() {
            match record {
                Change::Add { key, current, .. }
                | Change::Update { key, current, .. }
                | Change::Refresh { key, current, .. }
                | Change::Moved { key, current, .. } => {
                    guard.insert(key.clone(), current.clone());
                }
                Change::Remove { key, .. } => {
                    guard.remove(key);
                }
            }
        }
    }

    pub fn emit(&self, change_set: &ChangeSet<K, V>) {
        self.subject.on_next(change_set);
    }

    pub fn on_error(&self, error: &Error) {
        self.subject.on_error(error);
    }

    pub fn on_completed(&self) {
        self.subject.on_completed();
    }

    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.state.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.state.read().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.state.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.state.read().keys().cloned().collect()
    }
}
