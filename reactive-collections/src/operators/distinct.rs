//! Distinct (§4.3.5): reference-counted distinct values of `V -> D`.

use crate::cache::materialized::MaterializedKeyedStage;
use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::pipeline::ChangeSetSource;
use crate::reactive::{Observer, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

pub struct Distinct<K, V, D> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    selector: Arc<dyn Fn(&V) -> D + Send + Sync>,
    refcounts: Mutex<HashMap<D, usize>>,
    stage: MaterializedKeyedStage<D, D>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V, D> Distinct<K, V, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, selector: impl Fn(&V) -> D + Send + Sync + 'static) -> Arc<Self> {
        let this = Arc::new(Distinct { upstream, selector: Arc::new(selector), refcounts: Mutex::new(HashMap::new()), stage: MaterializedKeyedStage::new(), upstream_subscription: Mutex::new(None) });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    fn incref(refcounts: &mut HashMap<D, usize>, value: D, records: &mut Vec<Change<D, D>>) {
        let count = refcounts.entry(value.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            records.push(Change::Add { key: value.clone(), current: value, current_index: None });
        }
    }

    fn decref(refcounts: &mut HashMap<D, usize>, value: D, records: &mut Vec<Change<D, D>>) {
        if let Some(count) = refcounts.get_mut(&value) {
            *count -= 1;
            if *count == 0 {
                refcounts.remove(&value);
                records.push(Change::Remove { key: value.clone(), previous: value, previous_index: None });
            }
        }
    }
}

impl<K, V, D> Observer<ChangeSet<K, V>> for Distinct<K, V, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let selector = self.selector.clone();
        let mut refcounts = self.refcounts.lock();
        let mut records = Vec::new();

        for record in upstream_set.records() {
            match record {
                Change::Add { current, .. } => Self::incref(&mut refcounts, selector(current), &mut records),
                Change::Remove { previous, .. } => Self::decref(&mut refcounts, selector(previous), &mut records),
                Change::Update { current, previous, .. } => {
                    let (old, new) = (selector(previous), selector(current));
                    if old != new {
                        Self::decref(&mut refcounts, old, &mut records);
                        Self::incref(&mut refcounts, new, &mut records);
                    }
                }
                // Refresh/Moved never change value (I4), so the distinct
                // projection cannot have changed either.
                Change::Refresh { .. } | Change::Moved { .. } => {}
            }
        }

        drop(refcounts);
        for record in &records {
            self.stage.apply(&ChangeSet::single(record.clone()));
        }
        if let Some(change_set) = ChangeSet::from_records(records) {
            tracing::trace!(total = change_set.total(), "distinct emitted");
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

impl<K, V, D> ChangeSetSource<D, D> for Distinct<K, V, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<D, D>>>) -> Subscription<ChangeSet<D, D>> {
        self.stage.connect(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::test_support::RecordingObserver;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct CurrencyPair(&'static str);

    #[derive(Clone, Debug, PartialEq)]
    struct Trade {
        id: u32,
        pair: CurrencyPair,
    }

    #[test]
    fn currency_pairs_scenario() {
        let source = SourceCache::new(|t: &Trade| t.id);
        source.edit(|e| {
            e.add_or_update(Trade { id: 1, pair: CurrencyPair("USD/EUR") });
            e.add_or_update(Trade { id: 2, pair: CurrencyPair("USD/EUR") });
            e.add_or_update(Trade { id: 3, pair: CurrencyPair("USD/EUR") });
            e.add_or_update(Trade { id: 4, pair: CurrencyPair("EUR/GBP") });
        });
        let distinct = Distinct::new(source.clone(), |t: &Trade| t.pair.clone());
        let recorder = RecordingObserver::new();
        let _sub = distinct.connect(recorder.as_observer());
        assert_eq!(recorder.items()[0].adds(), 2);

        source.remove(&4);
        assert_eq!(recorder.items()[1].removes(), 1);

        source.remove(&1);
        assert_eq!(recorder.items().len(), 2); // still 2 left of USD/EUR, suppressed
    }
}
