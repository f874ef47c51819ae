use crate::change::record::{Change, ListChange};
use crate::change::reason::{ChangeReason, SortReason};

/// An ordered, non-empty batch of deltas to a keyed collection, plus cached
/// counters (§3). Construction goes through [`ChangeSet::from_records`],
/// which enforces invariant **I1** ("every emitted change set has `total >
/// 0`") by returning `None` for an empty batch instead of an empty value —
/// callers cannot accidentally publish nothing.
#[derive(Clone, Debug)]
pub struct ChangeSet<K, V> {
    records: Vec<Change<K, V>>,
    adds: usize,
    updates: usize,
    removes: usize,
    refreshes: usize,
    moves: usize,
}

impl<K: Clone, V: Clone> ChangeSet<K, V> {
    pub fn from_records(records: Vec<Change<K, V>>) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        let mut set = ChangeSet { records, adds: 0, updates: 0, removes: 0, refreshes: 0, moves: 0 };
        for record in &set.records {
            match record.reason() {
                ChangeReason::Add => set.adds += 1,
                ChangeReason::Update => set.updates += 1,
                ChangeReason::Remove => set.removes += 1,
                ChangeReason::Refresh => set.refreshes += 1,
                ChangeReason::Moved => set.moves += 1,
            }
        }
        Some(set)
    }

    pub fn single(record: Change<K, V>) -> Self {
        Self::from_records(vec![record]).expect("a single record is never empty")
    }

    pub fn records(&self) -> &[Change<K, V>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Change<K, V>> {
        self.records
    }

    pub fn total(&self) -> usize {
        self.records.len()
    }

    pub fn adds(&self) -> usize {
        self.adds
    }

    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn removes(&self) -> usize {
        self.removes
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes
    }

    pub fn moves(&self) -> usize {
        self.moves
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change<K, V>> {
        self.records.iter()
    }
}

impl<K: Clone, V: Clone> IntoIterator for ChangeSet<K, V> {
    type Item = Change<K, V>;
    type IntoIter = std::vec::IntoIter<Change<K, V>>;
    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// A [`ChangeSet`] plus a materialised sorted view of the full current
/// state (§3, "Sorted change set"). Emitted by sort-aware stages (§4.3.3)
/// and consumed by the binding adapter (§4.4).
#[derive(Clone, Debug)]
pub struct SortedChangeSet<K, V> {
    pub change_set: ChangeSet<K, V>,
    pub sorted_view: Vec<(K, V)>,
    pub sort_reason: SortReason,
}

impl<K: Clone, V: Clone> SortedChangeSet<K, V> {
    pub fn new(change_set: ChangeSet<K, V>, sorted_view: Vec<(K, V)>, sort_reason: SortReason) -> Self {
        SortedChangeSet { change_set, sorted_view, sort_reason }
    }

    pub fn total(&self) -> usize {
        self.change_set.total()
    }
}

/// An ordered, non-empty batch of deltas to an indexed (list) collection,
/// plus cached counters including `range_count` (§3). Same I1 discipline as
/// [`ChangeSet`].
#[derive(Clone, Debug)]
pub struct ListChangeSet<T> {
    records: Vec<ListChange<T>>,
    adds: usize,
    updates: usize,
    removes: usize,
    refreshes: usize,
    moves: usize,
    range_count: usize,
    total: usize,
}

impl<T: Clone> ListChangeSet<T> {
    pub fn from_records(records: Vec<ListChange<T>>) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        use crate::change::reason::ListChangeReason as R;
        let mut set = ListChangeSet {
            records,
            adds: 0,
            updates: 0,
            removes: 0,
            refreshes: 0,
            moves: 0,
            range_count: 0,
            total: 0,
        };
        for record in &set.records {
            set.total += record.item_count();
            match record.reason() {
                R::Add => set.adds += 1,
                R::AddRange => {
                    set.adds += record.item_count();
                    set.range_count += 1;
                }
                R::Replace => set.updates += 1,
                R::Remove => set.removes += 1,
                R::RemoveRange => {
                    set.removes += record.item_count();
                    set.range_count += 1;
                }
                R::Moved => set.moves += 1,
                R::Refresh => set.refreshes += 1,
                R::Clear => {
                    set.removes += record.item_count();
                    set.range_count += 1;
                }
            }
        }
        Some(set)
    }

    pub fn single(record: ListChange<T>) -> Self {
        Self::from_records(vec![record]).expect("a single record is never empty")
    }

    pub fn records(&self) -> &[ListChange<T>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ListChange<T>> {
        self.records
    }

    /// Total number of logical items touched (range records count every
    /// item in their batch, not themselves as one unit).
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn adds(&self) -> usize {
        self.adds
    }

    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn removes(&self) -> usize {
        self.removes
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes
    }

    pub fn moves(&self) -> usize {
        self.moves
    }

    pub fn range_count(&self) -> usize {
        self.range_count
    }
}

impl<T: Clone> IntoIterator for ListChangeSet<T> {
    type Item = ListChange<T>;
    type IntoIter = std::vec::IntoIter<ListChange<T>>;
    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
