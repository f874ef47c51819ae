/// Tag classifying a single delta to a keyed collection (§3).
///
/// `Refresh` never changes identity or value (I4): it signals that an
/// item's externally observable state mutated and stateful downstream
/// operators (filter/sort/aggregate) should re-evaluate without treating
/// the item as removed-then-readded. `Moved` is emitted only by sort-aware
/// stages and always carries both positions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ChangeReason {
    Add,
    Update,
    Remove,
    Refresh,
    Moved,
}

/// Tag classifying a single delta to an indexed (list) collection (§3).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ListChangeReason {
    Add,
    AddRange,
    Replace,
    Remove,
    RemoveRange,
    Moved,
    Refresh,
    Clear,
}

/// Why a sort-aware stage re-emitted its whole view (§4.3.3).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SortReason {
    InitialLoad,
    ComparerChanged,
    DataChanged,
    Reorder,
    Reset,
}
