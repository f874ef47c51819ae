//! Paging and virtualising (§4.3.8): windows a sorted stream to `(start,
//! count)`, re-indexed locally, emitting edits at the window edges as
//! upstream data shifts items across the boundary.

use crate::change::{Change, ChangeSet, SortReason, SortedChangeSet};
use crate::error::Error;
use crate::pipeline::SortedChangeSetSource;
use crate::reactive::{Observer, Subject, Subscription};
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

/// A positional (unkeyed) list diff via longest-common-subsequence
/// matching, used by [`crate::operators::filter::ListFilter`]'s
/// `CalculateDiff` policy (§4.3.1) where there is no key to anchor an
/// index-stable delta against. Matched items preserve their relative
/// order in both sequences, so removals (processed from the highest old
/// index down, so earlier indices stay valid) followed by insertions
/// (processed in increasing new-index order) reconstruct `new` exactly.
pub(crate) fn diff_positional<T: Clone + PartialEq>(old: &[T], new: &[T]) -> Vec<crate::change::ListChange<T>> {
    use crate::change::ListChange;

    let (n, m) = (old.len(), new.len());
    let mut dp = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            dp[i][j] = if old[i] == new[j] { dp[i + 1][j + 1] + 1 } else { dp[i + 1][j].max(dp[i][j + 1]) };
        }
    }

    let mut matched_old = vec![false; n];
    let mut matched_new = vec![false; m];
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            matched_old[i] = true;
            matched_new[j] = true;
            i += 1;
            j += 1;
        } else if dp[i + 1][j] >= dp[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }

    let mut records = Vec::new();
    for index in (0..n).rev() {
        if !matched_old[index] {
            records.push(ListChange::Remove { index, item: old[index].clone() });
        }
    }
    for index in 0..m {
        if !matched_new[index] {
            records.push(ListChange::Add { index, item: new[index].clone() });
        }
    }
    records
}

/// Diffs two windows into a script of `Remove`/`Update`/`Add` records that
/// reconstructs `new` when applied **in the emitted order** to a target
/// that starts out equal to `old`, one operation at a time (the discipline
/// [`crate::bind::Binder::apply_incremental`] relies on for I5). Matching
/// is keyed, not by value, via the same LCS technique [`diff_positional`]
/// uses, so a key retained at a different relative position is not treated
/// as an in-place move — this operator has no `Moved` case, only
/// remove-then-add, since that reordering breaks the "insert everything
/// before the target index is already in place" argument the Add pass
/// below relies on.
///
/// The three passes run in a fixed order:
/// 1. Removals, highest old index first, so an earlier removal never
///    invalidates a later one's index.
/// 2. In-place replacements for retained keys whose value changed,
///    addressed by their rank among the retained keys — their position in
///    the working list once removals (but no insertions) have landed.
/// 3. Insertions, lowest new index first, so each insert lands once
///    everything meant to precede it (retained or already inserted) is
///    already there.
fn diff_window<K: Eq + Hash + Clone, V: Clone + PartialEq>(old: &[(K, V)], new: &[(K, V)]) -> Vec<Change<K, V>> {
    let (n, m) = (old.len(), new.len());
    let mut dp = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            dp[i][j] = if old[i].0 == new[j].0 { dp[i + 1][j + 1] + 1 } else { dp[i + 1][j].max(dp[i][j + 1]) };
        }
    }

    let mut matched_old = vec![false; n];
    let mut matched_new = vec![false; m];
    let mut pairs = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i].0 == new[j].0 {
            matched_old[i] = true;
            matched_new[j] = true;
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if dp[i + 1][j] >= dp[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }

    let mut records = Vec::new();

    for index in (0..n).rev() {
        if !matched_old[index] {
            records.push(Change::Remove { key: old[index].0.clone(), previous: old[index].1.clone(), previous_index: Some(index) });
        }
    }

    for (rank, &(old_i, new_j)) in pairs.iter().enumerate() {
        let (key, previous) = &old[old_i];
        let current = &new[new_j].1;
        if previous != current {
            records.push(Change::Update { key: key.clone(), current: current.clone(), previous: previous.clone(), current_index: Some(rank), previous_index: Some(rank) });
        }
    }

    for index in 0..m {
        if !matched_new[index] {
            records.push(Change::Add { key: new[index].0.clone(), current: new[index].1.clone(), current_index: Some(index) });
        }
    }

    records
}

/// A windowing request: either `page(page, size)` (normalised to `start =
/// page * size`) or `virtualise(start, count)`. `top(n)` is `(0, n)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub count: usize,
}

impl Window {
    pub fn page(page: usize, size: usize) -> Self {
        Window { start: page * size, count: size }
    }

    pub fn virtualise(start: usize, count: usize) -> Self {
        Window { start, count }
    }

    pub fn top(n: usize) -> Self {
        Window { start: 0, count: n }
    }

    fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let start = self.start.min(items.len());
        let end = (self.start + self.count).min(items.len());
        &items[start..end]
    }
}

pub struct Page<K, V> {
    upstream: Arc<dyn SortedChangeSetSource<K, V>>,
    window: Mutex<Window>,
    full_sorted: Mutex<Vec<(K, V)>>,
    current_window: Mutex<Vec<(K, V)>>,
    subject: Subject<SortedChangeSet<K, V>>,
    upstream_subscription: Mutex<Option<Subscription<SortedChangeSet<K, V>>>>,
}

impl<K, V> Page<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + PartialEq + 'static,
{
    pub fn new(upstream: Arc<dyn SortedChangeSetSource<K, V>>, window: Window) -> Arc<Self> {
        let this = Arc::new(Page { upstream, window: Mutex::new(window), full_sorted: Mutex::new(Vec::new()), current_window: Mutex::new(Vec::new()), subject: Subject::new(), upstream_subscription: Mutex::new(None) });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    fn recompute(&self, reason: SortReason) {
        let window = *self.window.lock();
        let full = self.full_sorted.lock();
        let new_window: Vec<(K, V)> = window.slice(&full).to_vec();
        drop(full);
        let mut current = self.current_window.lock();
        let records = diff_window(&current, &new_window);
        *current = new_window.clone();
        drop(current);
        if let Some(change_set) = ChangeSet::from_records(records) {
            let sorted = SortedChangeSet::new(change_set, new_window, reason);
            tracing::trace!(total = sorted.total(), "page emitted");
            self.subject.on_next(&sorted);
        }
    }

    /// Changes the window. Always emits a full reset — the window's
    /// identity, not just its contents, just changed.
    pub fn set_window(&self, window: Window) {
        *self.window.lock() = window;
        self.recompute(SortReason::Reset);
    }
}

impl<K, V> Observer<SortedChangeSet<K, V>> for Page<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + PartialEq + 'static,
{
    fn on_next(&self, upstream_set: &SortedChangeSet<K, V>) {
        *self.full_sorted.lock() = upstream_set.sorted_view.clone();
        let reason = if upstream_set.sort_reason == SortReason::InitialLoad { SortReason::InitialLoad } else { SortReason::DataChanged };
        self.recompute(reason);
    }

    fn on_error(&self, error: &Error) {
        self.subject.on_error(error);
    }

    fn on_completed(&self) {
        self.subject.on_completed();
    }
}

impl<K, V> SortedChangeSetSource<K, V> for Page<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + PartialEq + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<SortedChangeSet<K, V>>>) -> Subscription<SortedChangeSet<K, V>> {
        let current = self.current_window.lock().clone();
        if !current.is_empty() {
            let records: Vec<Change<K, V>> = current.iter().enumerate().map(|(i, (k, v))| Change::Add { key: k.clone(), current: v.clone(), current_index: Some(i) }).collect();
            let change_set = ChangeSet::from_records(records).expect("non-empty window produces at least one record");
            observer.on_next(&SortedChangeSet::new(change_set, current, SortReason::InitialLoad));
        }
        self.subject.subscribe(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::operators::sort::{Sort, NEVER_RESET};
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
    fn windows_the_sorted_view() {
        let source = SourceCache::new(|v: &u32| *v);
        source.add_or_update_many(0..10);
        let sorted = Sort::new(source.clone(), |a: &u32, b: &u32| a.cmp(b), NEVER_RESET, false);
        let paged = Page::new(sorted.clone(), Window::page(1, 3)); // items 3,4,5
        let collector = Arc::new(Collector(StdMutex::new(Vec::new())));
        let _sub = paged.connect(collector.clone());
        let initial = collector.0.lock()[0].clone();
        assert_eq!(initial.sorted_view.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![3, 4, 5]);

        source.remove(&4);
        let after = collector.0.lock().last().unwrap().clone();
        // 4 leaves the window; 6 shifts in from beyond the boundary.
        assert_eq!(after.sorted_view.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![3, 5, 6]);
    }

    /// Applies a `diff_window` script the same way [`crate::bind::Binder`]
    /// does: sequentially, against a target that starts out equal to `old`.
    fn apply_script(old: &[(u32, u32)], records: &[Change<u32, u32>]) -> Vec<(u32, u32)> {
        let mut target: Vec<(u32, u32)> = old.to_vec();
        for record in records {
            match record {
                Change::Remove { previous_index, .. } => {
                    target.remove(previous_index.expect("page removals always carry previous_index"));
                }
                Change::Add { key, current, current_index } => {
                    target.insert(current_index.expect("page adds always carry current_index"), (key.clone(), current.clone()));
                }
                Change::Update { key, current, current_index, .. } => {
                    target[current_index.expect("page updates always carry current_index")] = (key.clone(), current.clone());
                }
                Change::Moved { .. } => panic!("page diffs never emit Moved"),
            }
        }
        target
    }

    #[test]
    fn diff_window_script_applies_sequentially_to_reconstruct_new() {
        // The maintainer-reported failure scenario: window [3,4,5], remove
        // upstream 4, window becomes [3,5,6].
        let old = vec![(3, 3), (4, 4), (5, 5)];
        let new = vec![(3, 3), (5, 5), (6, 6)];
        let records = diff_window(&old, &new);
        assert_eq!(apply_script(&old, &records), new);
    }

    #[test]
    fn diff_window_handles_reorder_within_window() {
        // A key present on both sides but at a conflicting relative
        // position must come out as remove-then-add, never Moved, so a
        // strictly sequential apply still lands on `new`.
        let old = vec![(1, 10), (2, 20), (3, 30)];
        let new = vec![(3, 30), (1, 10), (2, 20)];
        let records = diff_window(&old, &new);
        assert!(records.iter().all(|r| !matches!(r, Change::Moved { .. })));
        assert_eq!(apply_script(&old, &records), new);
    }

    #[test]
    fn diff_window_updates_value_in_place_without_moving() {
        let old = vec![(1, 10), (2, 20)];
        let new = vec![(1, 99), (2, 20)];
        let records = diff_window(&old, &new);
        assert_eq!(apply_script(&old, &records), new);
    }
}
