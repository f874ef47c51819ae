//! The aggregation kernel (C6): incremental reductions over the numeric
//! projection of a keyed change-set stream — sum, min, max, avg, count,
//! stddev — recomputed in `O(log n)` per touched key rather than by
//! re-scanning the whole collection on every edit.
//!
//! Grounded on the same "stateful transducer with initial materialisation"
//! shape the rest of the operator kernel (§4.3) uses, generalised from
//! change-set emission to scalar emission: [`Aggregate`] keeps a private
//! per-key numeric mirror plus running totals, and publishes a fresh
//! [`AggregateSnapshot`] through its own [`Subject`] whenever those totals
//! move. `min`/`max` use the same ordered-`Vec` + binary-search approach
//! [`crate::operators::sort::Sort`] uses for its order index — a multiset
//! of the current numeric values, kept sorted.

use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::pipeline::ChangeSetSource;
use crate::reactive::{Observer, Subject, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// A point-in-time summary of the aggregated numeric projection. `avg`,
/// `min`, `max` and `stddev` are absent over an empty collection rather
/// than some sentinel zero (the `Optional` carrier, §3).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AggregateSnapshot {
    pub count: usize,
    pub sum: f64,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Sample standard deviation (`n - 1` denominator). `None` below two
    /// observations, where sample variance is undefined.
    pub stddev: Option<f64>,
}

impl AggregateSnapshot {
    fn empty() -> Self {
        AggregateSnapshot { count: 0, sum: 0.0, avg: None, min: None, max: None, stddev: None }
    }
}

/// A live scalar publisher: the aggregate analogue of
/// [`crate::pipeline::ChangeSetSource`] (§6, "publish/connect"). A new
/// subscriber is handed the current snapshot immediately (I2's counterpart
/// for a scalar stream), then further snapshots as the aggregate moves.
pub trait ScalarSource<T>: Send + Sync {
    fn connect(&self, observer: Arc<dyn Observer<T>>) -> Subscription<T>;
}

struct AggregateState<K> {
    values: HashMap<K, f64>,
    /// Sorted multiset of current numeric values, for `O(log n)` min/max.
    order: Vec<f64>,
    sum: f64,
    sum_sq: f64,
}

impl<K: Eq + Hash + Clone> AggregateState<K> {
    fn new() -> Self {
        AggregateState { values: HashMap::new(), order: Vec::new(), sum: 0.0, sum_sq: 0.0 }
    }

    fn insert_ordered(&mut self, value: f64) {
        let index = self.order.partition_point(|existing| *existing < value);
        self.order.insert(index, value);
    }

    fn remove_ordered(&mut self, value: f64) {
        if let Some(index) = self.order.iter().position(|existing| *existing == value) {
            self.order.remove(index);
        }
    }

    fn upsert(&mut self, key: K, value: f64) {
        if let Some(previous) = self.values.remove(&key) {
            self.remove_ordered(previous);
            self.sum -= previous;
            self.sum_sq -= previous * previous;
        }
        self.values.insert(key, value);
        self.insert_ordered(value);
        self.sum += value;
        self.sum_sq += value * value;
    }

    fn remove(&mut self, key: &K) {
        if let Some(previous) = self.values.remove(key) {
            self.remove_ordered(previous);
            self.sum -= previous;
            self.sum_sq -= previous * previous;
        }
    }

    fn snapshot(&self) -> AggregateSnapshot {
        let count = self.order.len();
        if count == 0 {
            return AggregateSnapshot::empty();
        }
        let avg = self.sum / count as f64;
        let stddev = if count >= 2 {
            // `max(0.0, ...)` guards against floating-point cancellation
            // driving the variance estimate fractionally negative.
            let variance = ((self.sum_sq - count as f64 * avg * avg) / (count as f64 - 1.0)).max(0.0);
            Some(variance.sqrt())
        } else {
            None
        };
        AggregateSnapshot {
            count,
            sum: self.sum,
            avg: Some(avg),
            min: self.order.first().copied(),
            max: self.order.last().copied(),
            stddev,
        }
    }
}

/// `aggregate(selector)` (§2, C6): projects every item through `selector`
/// and maintains `sum`/`min`/`max`/`avg`/`count`/`stddev` incrementally.
pub struct Aggregate<K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    selector: Arc<dyn Fn(&V) -> f64 + Send + Sync>,
    state: Mutex<AggregateState<K>>,
    subject: Subject<AggregateSnapshot>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V> Aggregate<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, selector: impl Fn(&V) -> f64 + Send + Sync + 'static) -> Arc<Self> {
        let this = Arc::new(Aggregate {
            upstream,
            selector: Arc::new(selector),
            state: Mutex::new(AggregateState::new()),
            subject: Subject::new(),
            upstream_subscription: Mutex::new(None),
        });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        self.state.lock().snapshot()
    }
}

impl<K, V> Observer<ChangeSet<K, V>> for Aggregate<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let mut state = self.state.lock();
        for record in upstream_set.records() {
            let key = record.key().clone();
            match record {
                Change::Remove { .. } => state.remove(&key),
                _ => {
                    let current = record.current().expect("non-Remove records always carry a current value");
                    state.upsert(key, (self.selector)(current));
                }
            }
        }
        let snapshot = state.snapshot();
        drop(state);
        tracing::trace!(count = snapshot.count, sum = snapshot.sum, "aggregate updated");
        self.subject.on_next(&snapshot);
    }

    fn on_error(&self, error: &Error) {
        self.subject.on_error(error);
    }

    fn on_completed(&self) {
        self.subject.on_completed();
    }
}

impl<K, V> ScalarSource<AggregateSnapshot> for Aggregate<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<AggregateSnapshot>>) -> Subscription<AggregateSnapshot> {
        observer.on_next(&self.snapshot());
        self.subject.subscribe(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use parking_lot::Mutex as StdMutex;

    struct Collector(StdMutex<Vec<AggregateSnapshot>>);
    impl Observer<AggregateSnapshot> for Collector {
        fn on_next(&self, item: &AggregateSnapshot) {
            self.0.lock().push(*item);
        }
        fn on_error(&self, _error: &Error) {}
        fn on_completed(&self) {}
    }

    #[derive(Clone)]
    struct Trade {
        id: u32,
        notional: f64,
    }

    #[test]
    fn tracks_sum_min_max_avg_incrementally() {
        let source = SourceCache::new(|t: &Trade| t.id);
        source.add_or_update(Trade { id: 1, notional: 10.0 });
        source.add_or_update(Trade { id: 2, notional: 20.0 });
        source.add_or_update(Trade { id: 3, notional: 30.0 });

        let aggregate = Aggregate::new(source.clone(), |t: &Trade| t.notional);
        let collector = Arc::new(Collector(StdMutex::new(Vec::new())));
        let _sub = aggregate.connect(collector.clone());

        let initial = collector.0.lock()[0];
        assert_eq!(initial.count, 3);
        assert_eq!(initial.sum, 60.0);
        assert_eq!(initial.min, Some(10.0));
        assert_eq!(initial.max, Some(30.0));
        assert_eq!(initial.avg, Some(20.0));

        source.add_or_update(Trade { id: 1, notional: 40.0 });
        let after_update = collector.0.lock().last().copied().unwrap();
        assert_eq!(after_update.sum, 90.0);
        assert_eq!(after_update.min, Some(20.0));
        assert_eq!(after_update.max, Some(40.0));

        source.remove(&2);
        let after_remove = collector.0.lock().last().copied().unwrap();
        assert_eq!(after_remove.count, 2);
        assert_eq!(after_remove.sum, 70.0);
        assert_eq!(after_remove.min, Some(30.0));
    }

    #[test]
    fn stddev_absent_below_two_observations() {
        let source = SourceCache::new(|t: &Trade| t.id);
        source.add_or_update(Trade { id: 1, notional: 5.0 });
        let aggregate = Aggregate::new(source.clone(), |t: &Trade| t.notional);
        assert_eq!(aggregate.snapshot().stddev, None);

        source.add_or_update(Trade { id: 2, notional: 7.0 });
        let snapshot = aggregate.snapshot();
        assert!(snapshot.stddev.unwrap() > 0.0);
    }
}
