//! Time/size-bounded sources (§4.3.9). Both wrap an upstream keyed stream
//! and surface their own evictions as ordinary `Remove` change records,
//! matching "implemented at the source level" — from a downstream
//! subscriber's point of view these evictions are indistinguishable from
//! an upstream-initiated removal.

use crate::cache::materialized::MaterializedKeyedStage;
use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::pipeline::ChangeSetSource;
use crate::reactive::{Observer, Subscription};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `expire-after(time-selector, poll)` (§4.3.9): schedules removal when an
/// item's deadline elapses. The deadline is recomputed from `ttl` every
/// time the item is added, updated, or refreshed.
pub struct ExpireAfter<K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    ttl: Arc<dyn Fn(&V) -> Duration + Send + Sync>,
    deadlines: Mutex<HashMap<K, Instant>>,
    stage: MaterializedKeyedStage<K, V>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
    stop: Arc<AtomicBool>,
    poll_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<K, V> ExpireAfter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, ttl: impl Fn(&V) -> Duration + Send + Sync + 'static, poll: Duration) -> Arc<Self> {
        let this = Arc::new(ExpireAfter {
            upstream,
            ttl: Arc::new(ttl),
            deadlines: Mutex::new(HashMap::new()),
            stage: MaterializedKeyedStage::new(),
            upstream_subscription: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            poll_thread: Mutex::new(None),
        });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);

        let weak = Arc::downgrade(&this);
        let stop = this.stop.clone();
        let handle = std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                std::thread::sleep(poll);
                match weak.upgrade() {
                    Some(strong) => strong.sweep(),
                    None => break,
                }
            }
        });
        *this.poll_thread.lock() = Some(handle);
        this
    }

    fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<K> = {
            let deadlines = self.deadlines.lock();
            deadlines.iter().filter(|(_, deadline)| **deadline <= now).map(|(k, _)| k.clone()).collect()
        };
        if expired.is_empty() {
            return;
        }
        let mut records = Vec::new();
        let mut deadlines = self.deadlines.lock();
        for key in expired {
            deadlines.remove(&key);
            if let Some(previous) = self.stage.get(&key) {
                records.push(Change::Remove { key, previous, previous_index: None });
            }
        }
        drop(deadlines);
        for record in &records {
            self.stage.apply(&ChangeSet::single(record.clone()));
        }
        if let Some(change_set) = ChangeSet::from_records(records) {
            tracing::debug!(total = change_set.total(), "expire_after evicted");
            self.stage.emit(&change_set);
        }
    }
}

impl<K, V> Observer<ChangeSet<K, V>> for ExpireAfter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let ttl = self.ttl.clone();
        let mut deadlines = self.deadlines.lock();
        let mut records = Vec::new();
        for record in upstream_set.records() {
            let key = record.key().clone();
            match record {
                Change::Remove { previous, .. } => {
                    deadlines.remove(&key);
                    records.push(Change::Remove { key, previous: previous.clone(), previous_index: None });
                }
                _ => {
                    let current = record.current().expect("non-Remove records always carry a current value").clone();
                    deadlines.insert(key.clone(), Instant::now() + ttl(&current));
                    records.push(match self.stage.get(&key) {
                        Some(previous) => Change::Update { key, current, previous, current_index: None, previous_index: None },
                        None => Change::Add { key, current, current_index: None },
                    });
                }
            }
        }
        drop(deadlines);
        for record in &records {
            self.stage.apply(&ChangeSet::single(record.clone()));
        }
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

impl<K, V> ChangeSetSource<K, V> for ExpireAfter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.stage.connect(observer)
    }
}

impl<K, V> Drop for ExpireAfter<K, V> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.poll_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

/// `limit-size-to(n)` (§4.3.9): evicts the oldest entries by insertion
/// order once `n` is exceeded. Updates/refreshes do not affect an item's
/// position in the eviction order — only a fresh `Add` does.
pub struct LimitSizeTo<K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    limit: usize,
    insertion_order: Mutex<VecDeque<K>>,
    stage: MaterializedKeyedStage<K, V>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V> LimitSizeTo<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, limit: usize) -> Arc<Self> {
        let this = Arc::new(LimitSizeTo { upstream, limit, insertion_order: Mutex::new(VecDeque::new()), stage: MaterializedKeyedStage::new(), upstream_subscription: Mutex::new(None) });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }
}

impl<K, V> Observer<ChangeSet<K, V>> for LimitSizeTo<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let mut order = self.insertion_order.lock();
        let mut records = Vec::new();
        for record in upstream_set.records() {
            let key = record.key().clone();
            match record {
                Change::Remove { previous, .. } => {
                    order.retain(|k| k != &key);
                    records.push(Change::Remove { key, previous: previous.clone(), previous_index: None });
                }
                _ => {
                    let current = record.current().expect("non-Remove records always carry a current value").clone();
                    let is_new = self.stage.get(&key).is_none();
                    records.push(match self.stage.get(&key) {
                        Some(previous) => Change::Update { key: key.clone(), current, previous, current_index: None, previous_index: None },
                        None => Change::Add { key: key.clone(), current, current_index: None },
                    });
                    if is_new {
                        order.push_back(key);
                    }
                }
            }
        }
        while order.len() > self.limit {
            if let Some(oldest) = order.pop_front() {
                if let Some(previous) = self.stage.get(&oldest) {
                    records.push(Change::Remove { key: oldest, previous, previous_index: None });
                }
            }
        }
        drop(order);
        for record in &records {
            self.stage.apply(&ChangeSet::single(record.clone()));
        }
        if let Some(change_set) = ChangeSet::from_records(records) {
            tracing::trace!(total = change_set.total(), "limit_size_to emitted");
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

impl<K, V> ChangeSetSource<K, V> for LimitSizeTo<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.stage.connect(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::test_support::RecordingObserver;

    #[test]
    fn limit_size_evicts_oldest() {
        let source = SourceCache::new(|v: &i32| *v);
        let limited = LimitSizeTo::new(source.clone(), 2);
        let recorder = RecordingObserver::new();
        let _sub = limited.connect(recorder.as_observer());
        source.add_or_update(1);
        source.add_or_update(2);
        source.add_or_update(3);
        assert_eq!(limited.stage.len(), 2);
        assert_eq!(limited.stage.keys().into_iter().collect::<std::collections::HashSet<_>>(), [2, 3].into_iter().collect());
    }

    #[test]
    fn expire_after_removes_once_deadline_elapses() {
        let source = SourceCache::new(|v: &i32| *v);
        let expiring = ExpireAfter::new(source.clone(), |_: &i32| Duration::from_millis(20), Duration::from_millis(5));
        let recorder = RecordingObserver::new();
        let _sub = expiring.connect(recorder.as_observer());
        source.add_or_update(1);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(expiring.stage.len(), 0);
    }
}
