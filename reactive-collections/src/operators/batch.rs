//! Batching and rate control (§4.3.10): consolidates bursts of upstream
//! change sets into fewer, larger downstream emissions, plus the small
//! utility stages that shape when the first emission happens.

use crate::cache::materialized::MaterializedKeyedStage;
use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::pipeline::ChangeSetSource;
use crate::reactive::{Observer, Subject, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// When a buffered window flushes (§4.3.10: "window | count | trigger").
#[derive(Clone, Copy, Debug)]
pub enum BatchPolicy {
    /// Flush every `Duration` on a background tick, if anything buffered.
    Window(Duration),
    /// Flush as soon as `n` buffered records accumulate.
    Count(usize),
    /// Flush only in response to an explicit [`Batch::flush`] call — the
    /// "trigger" form, where the trigger is whatever external event the
    /// caller wires up (mirrors the capability-closure discipline used for
    /// [`crate::operators::property_filter::PropertyFilter`]'s mutation
    /// notifications rather than requiring a concrete trigger-stream type).
    Manual,
}

/// Coalesces a run of already-materialised change records into the
/// minimal set, the same I3 discipline [`crate::cache::change_aware::PendingChanges`]
/// applies to raw edits — generalised here to also absorb `Moved` records,
/// which `PendingChanges` never sees (a source cache has no position).
struct BufferedCoalescer<K, V> {
    order: Vec<K>,
    entries: HashMap<K, Change<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> BufferedCoalescer<K, V> {
    fn new() -> Self {
        BufferedCoalescer { order: Vec::new(), entries: HashMap::new() }
    }

    fn push(&mut self, record: Change<K, V>) {
        let key = record.key().clone();
        match self.entries.remove(&key) {
            None => {
                self.entries.insert(key.clone(), record);
                self.order.push(key);
            }
            Some(existing) => {
                let merged = Self::merge(existing, record);
                match merged {
                    Some(merged) => {
                        self.entries.insert(key, merged);
                    }
                    None => {
                        self.order.retain(|k| k != &key);
                    }
                }
            }
        }
    }

    /// `None` means the pair cancelled out (Add immediately undone by a
    /// later Remove within the same window, I3).
    fn merge(existing: Change<K, V>, incoming: Change<K, V>) -> Option<Change<K, V>> {
        match (&existing, &incoming) {
            (Change::Add { .. }, Change::Remove { .. }) => None,
            (Change::Add { key, .. }, Change::Update { current, .. } | Change::Refresh { current, .. }) => {
                Some(Change::Add { key: key.clone(), current: current.clone(), current_index: None })
            }
            (Change::Add { .. }, Change::Moved { .. }) => Some(existing),
            (Change::Update { key, previous, .. }, Change::Remove { .. }) => Some(Change::Remove { key: key.clone(), previous: previous.clone(), previous_index: None }),
            (Change::Update { key, previous, .. }, Change::Update { current, .. } | Change::Refresh { current, .. }) => {
                Some(Change::Update { key: key.clone(), current: current.clone(), previous: previous.clone(), current_index: None, previous_index: None })
            }
            (Change::Update { .. }, Change::Moved { .. }) => Some(existing),
            (Change::Refresh { key, current: baseline, .. }, Change::Remove { .. }) => Some(Change::Remove { key: key.clone(), previous: baseline.clone(), previous_index: None }),
            (Change::Refresh { key, current: baseline, .. }, Change::Update { current, .. }) => {
                Some(Change::Update { key: key.clone(), current: current.clone(), previous: baseline.clone(), current_index: None, previous_index: None })
            }
            (Change::Refresh { key, .. }, Change::Refresh { current, .. }) => Some(Change::Refresh { key: key.clone(), current: current.clone(), current_index: None }),
            (Change::Refresh { .. }, Change::Moved { .. }) => Some(existing),
            (Change::Remove { key, .. }, Change::Add { current, .. }) => Some(Change::Add { key: key.clone(), current: current.clone(), current_index: None }),
            // A Remove is terminal for anything else re-touching the same
            // key in the same window; keep the Remove.
            (Change::Remove { .. }, _) => Some(existing),
            (Change::Moved { .. }, _) => Some(incoming),
        }
    }

    fn into_change_set(self) -> Option<ChangeSet<K, V>> {
        let records = self.order.into_iter().filter_map(|key| self.entries.get(&key).cloned()).collect::<Vec<_>>();
        ChangeSet::from_records(records)
    }
}

/// `batch(window | count | trigger)` (§4.3.10).
pub struct Batch<K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    policy: BatchPolicy,
    buffer: Mutex<BufferedCoalescer<K, V>>,
    buffered_count: AtomicUsize,
    stage: MaterializedKeyedStage<K, V>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
    stop: Arc<AtomicBool>,
    tick_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<K, V> Batch<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, policy: BatchPolicy) -> Arc<Self> {
        let this = Arc::new(Batch {
            upstream,
            policy,
            buffer: Mutex::new(BufferedCoalescer::new()),
            buffered_count: AtomicUsize::new(0),
            stage: MaterializedKeyedStage::new(),
            upstream_subscription: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            tick_thread: Mutex::new(None),
        });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);

        if let BatchPolicy::Window(window) = policy {
            let weak = Arc::downgrade(&this);
            let stop = this.stop.clone();
            let handle = std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(window);
                    match weak.upgrade() {
                        Some(strong) => strong.flush(),
                        None => break,
                    }
                }
            });
            *this.tick_thread.lock() = Some(handle);
        }
        this
    }

    /// Forces a flush regardless of policy — the only way a `Manual`
    /// (trigger-driven) batch ever emits.
    pub fn flush(&self) {
        let mut buffer = self.buffer.lock();
        let drained = std::mem::replace(&mut *buffer, BufferedCoalescer::new());
        drop(buffer);
        self.buffered_count.store(0, Ordering::Release);
        if let Some(change_set) = drained.into_change_set() {
            tracing::debug!(total = change_set.total(), "batch flushed");
            self.stage.emit(&change_set);
        }
    }
}

impl<K, V> Observer<ChangeSet<K, V>> for Batch<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        self.stage.apply(upstream_set);
        let mut buffer = self.buffer.lock();
        for record in upstream_set.records() {
            buffer.push(record.clone());
        }
        let buffered = self.buffered_count.fetch_add(upstream_set.total(), Ordering::AcqRel) + upstream_set.total();
        drop(buffer);

        if let BatchPolicy::Count(threshold) = self.policy {
            if buffered >= threshold {
                self.flush();
            }
        }
    }

    fn on_error(&self, error: &Error) {
        self.stage.on_error(error);
    }

    fn on_completed(&self) {
        self.flush();
        self.stage.on_completed();
    }
}

impl<K, V> ChangeSetSource<K, V> for Batch<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.stage.connect(observer)
    }
}

impl<K, V> Drop for Batch<K, V> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.tick_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

/// `defer-until-loaded` (§4.3.10): suppresses every downstream emission
/// until the first non-empty batch arrives, then passes everything
/// through unchanged — for a consumer that would rather see nothing than
/// a sequence of partial loads while upstream is still filling in.
pub struct DeferUntilLoaded<K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    loaded: AtomicBool,
    stage: MaterializedKeyedStage<K, V>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V> DeferUntilLoaded<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>) -> Arc<Self> {
        let this = Arc::new(DeferUntilLoaded { upstream, loaded: AtomicBool::new(false), stage: MaterializedKeyedStage::new(), upstream_subscription: Mutex::new(None) });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }
}

impl<K, V> Observer<ChangeSet<K, V>> for DeferUntilLoaded<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        if !self.loaded.load(Ordering::Acquire) {
            // The first batch becomes the initial materialisation: the
            // downstream subscriber's replay (I2) already shows it once
            // connected, so it is applied but not separately emitted.
            self.stage.apply(upstream_set);
            self.loaded.store(true, Ordering::Release);
            return;
        }
        self.stage.apply(upstream_set);
        self.stage.emit(upstream_set);
    }

    fn on_error(&self, error: &Error) {
        self.stage.on_error(error);
    }

    fn on_completed(&self) {
        self.stage.on_completed();
    }
}

impl<K, V> ChangeSetSource<K, V> for DeferUntilLoaded<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.stage.connect(observer)
    }
}

/// `skip-initial` (§4.3.10): drops the very first batch a subscriber would
/// otherwise see via I2's replay-on-connect, then behaves transparently —
/// for a consumer that wants to react only to subsequent changes, not the
/// pre-existing state.
pub struct SkipInitial<K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    subject: Subject<ChangeSet<K, V>>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V> SkipInitial<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>) -> Arc<Self> {
        let this = Arc::new(SkipInitial { upstream, subject: Subject::new(), upstream_subscription: Mutex::new(None) });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }
}

impl<K, V> Observer<ChangeSet<K, V>> for SkipInitial<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        self.subject.on_next(upstream_set);
    }

    fn on_error(&self, error: &Error) {
        self.subject.on_error(error);
    }

    fn on_completed(&self) {
        self.subject.on_completed();
    }
}

impl<K, V> ChangeSetSource<K, V> for SkipInitial<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Deliberately does not replay anything on connect — that replay is
    /// exactly the "initial" this stage exists to skip. A second
    /// subscriber attaching later sees only what changes from then on,
    /// which is consistent with this stage never retaining a mirror.
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.subject.subscribe(observer)
    }
}

/// `not-empty` (§4.3.10): a defense-in-depth no-op filter guaranteeing I1
/// to a downstream consumer that cannot tolerate a stage ever slipping
/// through an empty change set — every operator in this crate already
/// upholds I1 by construction (`ChangeSet::from_records` returns `None`
/// for an empty `Vec`), so this stage exists purely as a boundary check
/// for change sets arriving from outside this crate's own discipline.
pub struct NotEmpty<K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    subject: Subject<ChangeSet<K, V>>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V> NotEmpty<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>) -> Arc<Self> {
        let this = Arc::new(NotEmpty { upstream, subject: Subject::new(), upstream_subscription: Mutex::new(None) });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }
}

impl<K, V> Observer<ChangeSet<K, V>> for NotEmpty<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        if upstream_set.total() == 0 {
            tracing::warn!("dropped an empty change set that should have been unreachable");
            return;
        }
        self.subject.on_next(upstream_set);
    }

    fn on_error(&self, error: &Error) {
        self.subject.on_error(error);
    }

    fn on_completed(&self) {
        self.subject.on_completed();
    }
}

impl<K, V> ChangeSetSource<K, V> for NotEmpty<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.subject.subscribe(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::test_support::RecordingObserver;

    #[test]
    fn count_policy_flushes_once_threshold_reached() {
        let source = SourceCache::new(|v: &i32| *v);
        let batched = Batch::new(source.clone(), BatchPolicy::Count(3));
        let recorder = RecordingObserver::new();
        let _sub = batched.connect(recorder.as_observer());
        source.add_or_update(1);
        source.add_or_update(2);
        assert_eq!(recorder.items().len(), 0);
        source.add_or_update(3);
        assert_eq!(recorder.items().len(), 1);
        assert_eq!(recorder.items()[0].total(), 3);
    }

    #[test]
    fn manual_policy_only_flushes_on_explicit_call() {
        let source = SourceCache::new(|v: &i32| *v);
        let batched = Batch::new(source.clone(), BatchPolicy::Manual);
        let recorder = RecordingObserver::new();
        let _sub = batched.connect(recorder.as_observer());
        source.add_or_update(1);
        source.add_or_update(2);
        assert_eq!(recorder.items().len(), 0);
        batched.flush();
        assert_eq!(recorder.items().len(), 1);
        assert_eq!(recorder.items()[0].total(), 2);
    }

    #[test]
    fn add_then_remove_within_a_window_cancel() {
        let source = SourceCache::new(|v: &i32| *v);
        let batched = Batch::new(source.clone(), BatchPolicy::Manual);
        let recorder = RecordingObserver::new();
        let _sub = batched.connect(recorder.as_observer());
        source.add_or_update(1);
        source.remove(&1);
        batched.flush();
        assert_eq!(recorder.items().len(), 0);
    }

    #[test]
    fn defer_until_loaded_suppresses_the_first_batch() {
        let source = SourceCache::new(|v: &i32| *v);
        let deferred = DeferUntilLoaded::new(source.clone());
        source.add_or_update(1);
        let recorder = RecordingObserver::new();
        let _sub = deferred.connect(recorder.as_observer());
        assert_eq!(recorder.items()[0].total(), 1); // I2 replay of already-applied state
        source.add_or_update(2);
        assert_eq!(recorder.items().len(), 2);
    }

    #[test]
    fn skip_initial_does_not_replay_on_connect() {
        let source = SourceCache::new(|v: &i32| *v);
        source.add_or_update(1);
        let skipped = SkipInitial::new(source.clone());
        let recorder = RecordingObserver::new();
        let _sub = skipped.connect(recorder.as_observer());
        assert_eq!(recorder.items().len(), 0);
        source.add_or_update(2);
        assert_eq!(recorder.items().len(), 1);
    }
}
