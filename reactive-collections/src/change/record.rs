use crate::change::reason::{ChangeReason, ListChangeReason};

/// A single delta to a keyed collection (§3, "Change record (keyed)").
///
/// Modelled as a tagged variant rather than `{reason, current: Option<V>,
/// previous: Option<V>}` with reason-dependent validity, so the presence of
/// `previous`/`current`/indices is enforced by the type instead of by
/// convention: `Add` simply has no `previous` field to misuse.
#[derive(Clone, Debug)]
pub enum Change<K, V> {
    Add { key: K, current: V, current_index: Option<usize> },
    Update { key: K, current: V, previous: V, current_index: Option<usize>, previous_index: Option<usize> },
    Remove { key: K, previous: V, previous_index: Option<usize> },
    Refresh { key: K, current: V, current_index: Option<usize> },
    Moved { key: K, current: V, previous_index: usize, current_index: usize },
}

impl<K: Clone, V: Clone> Change<K, V> {
    pub fn reason(&self) -> ChangeReason {
        match self {
            Change::Add { .. } => ChangeReason::Add,
            Change::Update { .. } => ChangeReason::Update,
            Change::Remove { .. } => ChangeReason::Remove,
            Change::Refresh { .. } => ChangeReason::Refresh,
            Change::Moved { .. } => ChangeReason::Moved,
        }
    }

    pub fn key(&self) -> &K {
        match self {
            Change::Add { key, .. }
            | Change::Update { key, .. }
            | Change::Remove { key, .. }
            | Change::Refresh { key, .. }
            | Change::Moved { key, .. } => key,
        }
    }

    /// The value as it exists after this change, if any (absent only for
    /// `Remove`).
    pub fn current(&self) -> Option<&V> {
        match self {
            Change::Add { current, .. }
            | Change::Update { current, .. }
            | Change::Refresh { current, .. }
            | Change::Moved { current, .. } => Some(current),
            Change::Remove { .. } => None,
        }
    }

    /// The value as it existed before this change, if any (absent only for
    /// `Add`).
    pub fn previous(&self) -> Option<&V> {
        match self {
            Change::Update { previous, .. } | Change::Remove { previous, .. } => Some(previous),
            _ => None,
        }
    }

    pub fn current_index(&self) -> Option<usize> {
        match self {
            Change::Add { current_index, .. }
            | Change::Update { current_index, .. }
            | Change::Refresh { current_index, .. } => *current_index,
            Change::Moved { current_index, .. } => Some(*current_index),
            Change::Remove { .. } => None,
        }
    }

    pub fn previous_index(&self) -> Option<usize> {
        match self {
            Change::Update { previous_index, .. } => *previous_index,
            Change::Remove { previous_index, .. } => *previous_index,
            Change::Moved { previous_index, .. } => Some(*previous_index),
            _ => None,
        }
    }
}

/// A single delta to an indexed (list) collection (§3, "Change record
/// (indexed)"). Ranges carry a contiguous batch starting at `index`.
#[derive(Clone, Debug)]
pub enum ListChange<T> {
    Add { index: usize, item: T },
    AddRange { index: usize, items: Vec<T> },
    Replace { index: usize, current: T, previous: T },
    Remove { index: usize, item: T },
    RemoveRange { index: usize, items: Vec<T> },
    Moved { previous_index: usize, current_index: usize, item: T },
    Refresh { index: usize, item: T },
    Clear { items: Vec<T> },
}

impl<T: Clone> ListChange<T> {
    pub fn reason(&self) -> ListChangeReason {
        match self {
            ListChange::Add { .. } => ListChangeReason::Add,
            ListChange::AddRange { .. } => ListChangeReason::AddRange,
            ListChange::Replace { .. } => ListChangeReason::Replace,
            ListChange::Remove { .. } => ListChangeReason::Remove,
            ListChange::RemoveRange { .. } => ListChangeReason::RemoveRange,
            ListChange::Moved { .. } => ListChangeReason::Moved,
            ListChange::Refresh { .. } => ListChangeReason::Refresh,
            ListChange::Clear { .. } => ListChangeReason::Clear,
        }
    }

    /// Number of logical items this single record accounts for (a range
    /// record counts every item in its batch).
    pub fn item_count(&self) -> usize {
        match self {
            ListChange::AddRange { items, .. } | ListChange::RemoveRange { items, .. } | ListChange::Clear { items } => items.len(),
            _ => 1,
        }
    }
}
