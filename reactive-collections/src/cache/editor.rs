use crate::cache::change_aware::PendingChanges;
use std::collections::HashMap;
use std::hash::Hash;

/// The scoped updater passed to [`crate::cache::SourceCache::edit`]. All
/// adds/updates/removes/refreshes/clears performed through it accumulate
/// into one change set, emitted on scope exit (§4.1).
pub struct CacheEditor<'a, K, V> {
    pub(crate) data: &'a mut HashMap<K, V>,
    pub(crate) pending: &'a mut PendingChanges<K, V>,
    pub(crate) key_selector: &'a (dyn Fn(&V) -> K + Send + Sync),
}

impl<'a, K: Eq + Hash + Clone, V: Clone> CacheEditor<'a, K, V> {
    pub fn add_or_update(&mut self, item: V) {
        let key = (self.key_selector)(&item);
        match self.data.insert(key.clone(), item.clone()) {
            Some(previous) => self.pending.record_update(key, previous, item),
            None => self.pending.record_add(key, item),
        }
    }

    pub fn add_or_update_many(&mut self, items: impl IntoIterator<Item = V>) {
        for item in items {
            self.add_or_update(item);
        }
    }

    pub fn remove(&mut self, key: &K) {
        if let Some(previous) = self.data.remove(key) {
            self.pending.record_remove(key.clone(), previous);
        }
    }

    pub fn remove_many<'k>(&mut self, keys: impl IntoIterator<Item = &'k K>)
    where
        K: 'k,
    {
        for key in keys {
            self.remove(key);
        }
    }

    /// Re-evaluates stateful downstream operators for `key` without
    /// replacing the item (I4). Silently does nothing if `key` is not
    /// present — see SPEC_FULL.md §9's Open Question resolution: a refresh
    /// on a non-existent key is dropped, not an error.
    pub fn refresh(&mut self, key: &K) {
        if let Some(current) = self.data.get(key).cloned() {
            self.pending.record_refresh(key.clone(), current);
        }
    }

    pub fn refresh_many<'k>(&mut self, keys: impl IntoIterator<Item = &'k K>)
    where
        K: 'k,
    {
        for key in keys {
            self.refresh(key);
        }
    }

    pub fn refresh_all(&mut self) {
        let keys: Vec<K> = self.data.keys().cloned().collect();
        for key in keys {
            self.refresh(&key);
        }
    }

    pub fn clear(&mut self) {
        let keys: Vec<K> = self.data.keys().cloned().collect();
        for key in keys {
            self.remove(&key);
        }
    }

    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.data.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }
}
