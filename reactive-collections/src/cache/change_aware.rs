use crate::change::{Change, ChangeReason, ChangeSet};
use std::collections::HashMap;
use std::hash::Hash;

struct PendingEntry<V> {
    reason: ChangeReason,
    /// The value as it existed before this batch started touching the key,
    /// captured on first touch only. Needed so an Update-then-Remove within
    /// one batch reports the true pre-batch previous, not an intermediate
    /// one (I3).
    baseline_previous: Option<V>,
    current: Option<V>,
}

/// Accumulates edits to a keyed collection within one batch, coalescing
/// them to the minimal reason per key (I3): `Add` then `Remove` cancel,
/// `Add` then `Update` collapses to `Add` with the final value, and so on.
///
/// Shared by the source cache's edit scope (C3) and any operator that
/// rebuilds a keyed delta across one upstream batch (distinct, group).
pub struct PendingChanges<K, V> {
    order: Vec<K>,
    entries: HashMap<K, PendingEntry<V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for PendingChanges<K, V> {
    fn default() -> Self {
        PendingChanges { order: Vec::new(), entries: HashMap::new() }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> PendingChanges<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `key` did not exist in the backing store before this call.
    pub fn record_add(&mut self, key: K, current: V) {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                // Re-added after being removed earlier in this batch: from a
                // downstream observer's perspective this is an update of the
                // item they already know about.
                entry.reason = ChangeReason::Update;
                entry.current = Some(current);
            }
            None => {
                self.entries.insert(key.clone(), PendingEntry { reason: ChangeReason::Add, baseline_previous: None, current: Some(current) });
                self.order.push(key);
            }
        }
    }

    /// `key` existed in the backing store (with value `previous`) before
    /// this call.
    pub fn record_update(&mut self, key: K, previous: V, current: V) {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                if entry.reason == ChangeReason::Add {
                    // Add then Update in the same batch: still an Add, just
                    // with the final value (I3).
                    entry.current = Some(current);
                } else {
                    entry.reason = ChangeReason::Update;
                    entry.current = Some(current);
                }
            }
            None => {
                self.entries.insert(key.clone(), PendingEntry { reason: ChangeReason::Update, baseline_previous: Some(previous), current: Some(current) });
                self.order.push(key);
            }
        }
    }

    /// `key` existed in the backing store (with value `previous`) before
    /// this call.
    pub fn record_remove(&mut self, key: K, previous: V) {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.reason == ChangeReason::Add => {
                // Add then Remove in the same batch cancel outright (I3).
                self.entries.remove(&key);
            }
            Some(entry) => {
                entry.reason = ChangeReason::Remove;
                entry.current = None;
            }
            None => {
                self.entries.insert(key.clone(), PendingEntry { reason: ChangeReason::Remove, baseline_previous: Some(previous), current: None });
                self.order.push(key);
            }
        }
    }

    /// `key` existed in the backing store with value `current`, unchanged.
    pub fn record_refresh(&mut self, key: K, current: V) {
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.reason != ChangeReason::Add && entry.reason != ChangeReason::Update {
                entry.reason = ChangeReason::Refresh;
            }
            entry.current = Some(current);
        } else {
            self.entries.insert(key.clone(), PendingEntry { reason: ChangeReason::Refresh, baseline_previous: None, current: Some(current) });
            self.order.push(key);
        }
    }

    /// Flushes the accumulated edits into a change set, or `None` if
    /// everything cancelled out (I1: an empty change set is never
    /// emitted).
    pub fn into_change_set(mut self) -> Option<ChangeSet<K, V>> {
        let mut records = Vec::with_capacity(self.order.len());
        for key in self.order {
            if let Some(entry) = self.entries.remove(&key) {
                let record = match entry.reason {
                    ChangeReason::Add => Change::Add { key, current: entry.current.expect("add entry always carries a current value"), current_index: None },
                    ChangeReason::Update => Change::Update {
                        key,
                        current: entry.current.expect("update entry always carries a current value"),
                        previous: entry.baseline_previous.expect("update entry always carries a baseline previous value"),
                        current_index: None,
                        previous_index: None,
                    },
                    ChangeReason::Remove => Change::Remove {
                        key,
                        previous: entry.baseline_previous.expect("remove entry always carries a baseline previous value"),
                        previous_index: None,
                    },
                    ChangeReason::Refresh => Change::Refresh { key, current: entry.current.expect("refresh entry always carries a current value"), current_index: None },
                    ChangeReason::Moved => unreachable!("pending changes never records a Moved reason directly"),
                };
                records.push(record);
            }
        }
        ChangeSet::from_records(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_remove_cancel() {
        let mut pending = PendingChanges::new();
        pending.record_add("a", 1);
        pending.record_remove("a", 1);
        assert!(pending.into_change_set().is_none());
    }

    #[test]
    fn add_then_update_collapses_to_add_with_final_value() {
        let mut pending = PendingChanges::new();
        pending.record_add("a", 1);
        pending.record_update("a", 1, 2);
        let set = pending.into_change_set().unwrap();
        assert_eq!(set.total(), 1);
        match &set.records()[0] {
            Change::Add { current, .. } => assert_eq!(*current, 2),
            other => panic!("expected Add, got {other:?}"),
        }
    }

    #[test]
    fn update_then_remove_uses_baseline_previous() {
        let mut pending = PendingChanges::new();
        pending.record_update("a", 10, 20);
        pending.record_remove("a", 20);
        let set = pending.into_change_set().unwrap();
        match &set.records()[0] {
            Change::Remove { previous, .. } => assert_eq!(*previous, 10),
            other => panic!("expected Remove, got {other:?}"),
        }
    }
}
