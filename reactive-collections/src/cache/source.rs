use crate::cache::change_aware::PendingChanges;
use crate::cache::editor::CacheEditor;
use crate::cache::materialized::MaterializedKeyedStage;
use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::pipeline::ChangeSetSource;
use crate::reactive::{Observer, Subscription};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// C3 — the single-writer edit surface for a keyed collection (§4.1).
///
/// Constructed with a key selector `V -> K`. Passing an identity closure
/// (`|v| v.clone()`) recovers the "no key selector supplied" behaviour
/// spec.md describes, where equal items intentionally collide.
pub struct SourceCache<K, V> {
    stage: MaterializedKeyedStage<K, V>,
    key_selector: Arc<dyn Fn(&V) -> K + Send + Sync>,
    revision: AtomicU64,
    count_subject: crate::reactive::Subject<usize>,
    last_published_count: AtomicUsize,
}

const NO_COUNT_PUBLISHED: usize = usize::MAX;

impl<K, V> SourceCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(key_selector: impl Fn(&V) -> K + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(SourceCache {
            stage: MaterializedKeyedStage::new(),
            key_selector: Arc::new(key_selector),
            revision: AtomicU64::new(0),
            count_subject: crate::reactive::Subject::new(),
            last_published_count: AtomicUsize::new(NO_COUNT_PUBLISHED),
        })
    }

    /// Revision counter, incremented once per committed `edit` scope.
    /// Lets a consumer tell whether two change sets were observed in the
    /// same commit (SPEC_FULL.md §10).
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Scoped acquisition of a mutable updater; all edits performed
    /// through it accumulate into one change set, emitted on scope exit.
    pub fn edit<R>(&self, f: impl FnOnce(&mut CacheEditor<'_, K, V>) -> R) -> R {
        let mut pending = PendingChanges::new();
        let result;
        let change_set;
        {
            let mut guard = self.stage.raw_write();
            let mut editor = CacheEditor { data: &mut guard, pending: &mut pending, key_selector: &*self.key_selector };
            result = f(&mut editor);
            change_set = pending.into_change_set();
        }
        self.commit(change_set);
        result
    }

    /// As [`Self::edit`], but the closure may fail. Edits accumulated
    /// before the failure are still committed and published; the error is
    /// then surfaced to subscribers via `on_error`, which terminates the
    /// stream (§4.1, §7 kind 1).
    pub fn try_edit<R>(&self, f: impl FnOnce(&mut CacheEditor<'_, K, V>) -> anyhow::Result<R>) -> anyhow::Result<R> {
        let mut pending = PendingChanges::new();
        let result;
        let change_set;
        {
            let mut guard = self.stage.raw_write();
            let mut editor = CacheEditor { data: &mut guard, pending: &mut pending, key_selector: &*self.key_selector };
            result = f(&mut editor);
            change_set = pending.into_change_set();
        }
        self.commit(change_set);
        if let Err(error) = &result {
            tracing::warn!(%error, "edit closure failed; terminating subscribers");
            self.stage.on_error(&Error::UserFn(anyhow::anyhow!("{error}")));
        }
        result
    }

    fn commit(&self, change_set: Option<ChangeSet<K, V>>) {
        if let Some(change_set) = change_set {
            self.revision.fetch_add(1, Ordering::AcqRel);
            tracing::trace!(total = change_set.total(), adds = change_set.adds(), updates = change_set.updates(), removes = change_set.removes(), "cache edit committed");
            self.stage.emit(&change_set);
        }
        self.publish_count();
    }

    fn publish_count(&self) {
        let count = self.stage.len();
        let previous = self.last_published_count.swap(count, Ordering::AcqRel);
        if previous != count {
            self.count_subject.on_next(&count);
        }
    }

    pub fn add_or_update(&self, item: V) {
        self.edit(|editor| editor.add_or_update(item));
    }

    pub fn add_or_update_many(&self, items: impl IntoIterator<Item = V>) {
        self.edit(|editor| editor.add_or_update_many(items));
    }

    pub fn remove(&self, key: &K) {
        self.edit(|editor| editor.remove(key));
    }

    pub fn remove_many<'k>(&self, keys: impl IntoIterator<Item = &'k K>)
    where
        K: 'k,
    {
        self.edit(|editor| editor.remove_many(keys));
    }

    pub fn refresh(&self, key: &K) {
        self.edit(|editor| editor.refresh(key));
    }

    pub fn refresh_many<'k>(&self, keys: impl IntoIterator<Item = &'k K>)
    where
        K: 'k,
    {
        self.edit(|editor| editor.refresh_many(keys));
    }

    pub fn refresh_all(&self) {
        self.edit(|editor| editor.refresh_all());
    }

    pub fn clear(&self) {
        self.edit(|editor| editor.clear());
    }

    pub fn lookup(&self, key: &K) -> Option<V> {
        self.stage.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.stage.contains(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.stage.keys()
    }

    pub fn items(&self) -> Vec<V> {
        self.stage.snapshot().into_iter().map(|(_, v)| v).collect()
    }

    pub fn key_values(&self) -> Vec<(K, V)> {
        self.stage.snapshot()
    }

    pub fn count(&self) -> usize {
        self.stage.len()
    }

    /// A stream of change records for a single key (add/update/remove/
    /// refresh), starting with the current value if present.
    pub fn watch(&self, key: K, observer: Arc<dyn Observer<Change<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        if let Some(current) = self.stage.get(&key) {
            observer.on_next(&Change::Add { key: key.clone(), current, current_index: None });
        }
        self.stage.subscribe_raw(Arc::new(KeyWatcher { key, inner: observer }))
    }

    /// A deduplicated stream of the current count.
    pub fn count_changed(&self, observer: Arc<dyn Observer<usize>>) -> Subscription<usize> {
        let count = self.stage.len();
        observer.on_next(&count);
        self.count_subject.subscribe(observer)
    }
}

impl<K, V> ChangeSetSource<K, V> for SourceCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>> {
        self.stage.connect(observer)
    }
}

struct KeyWatcher<K, V> {
    key: K,
    inner: Arc<dyn Observer<Change<K, V>>>,
}

impl<K, V> Observer<ChangeSet<K, V>> for KeyWatcher<K, V>
where
    K: Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn on_next(&self, item: &ChangeSet<K, V>) {
        for record in item.records() {
            if record.key() == &self.key {
                self.inner.on_next(record);
            }
        }
    }

    fn on_error(&self, error: &Error) {
        self.inner.on_error(error);
    }

    fn on_completed(&self) {
        self.inner.on_completed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingObserver;

    #[derive(Clone, Debug, PartialEq)]
    struct Person {
        name: &'static str,
        age: u32,
    }

    fn cache() -> Arc<SourceCache<&'static str, Person>> {
        SourceCache::new(|p: &Person| p.name)
    }

    #[test]
    fn initial_batch_then_incremental_edits() {
        let source = cache();
        let recorder = RecordingObserver::new();
        let _sub = source.connect(recorder.as_observer());

        source.edit(|editor| {
            editor.add_or_update(Person { name: "A", age: 17 });
            editor.add_or_update(Person { name: "B", age: 20 });
        });

        let batches = recorder.items();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].total(), 2);
        assert_eq!(batches[0].adds(), 2);
    }

    #[test]
    fn add_then_remove_in_one_batch_emits_nothing() {
        let source = cache();
        let recorder = RecordingObserver::new();
        let _sub = source.connect(recorder.as_observer());

        source.edit(|editor| {
            editor.add_or_update(Person { name: "A", age: 1 });
            editor.remove(&"A");
        });

        assert!(recorder.items().is_empty());
    }

    #[test]
    fn refresh_on_missing_key_is_dropped_silently() {
        let source = cache();
        let recorder = RecordingObserver::new();
        let _sub = source.connect(recorder.as_observer());
        source.refresh(&"missing");
        assert!(recorder.items().is_empty());
    }

    #[test]
    fn count_changed_is_deduplicated() {
        let source = cache();
        let recorder: RecordingObserver<usize> = RecordingObserver::new();
        let _sub = source.count_changed(recorder.as_observer());
        source.add_or_update(Person { name: "A", age: 1 });
        source.refresh(&"A"); // count unchanged, must not republish
        source.add_or_update(Person { name: "B", age: 2 });
        assert_eq!(recorder.items(), vec![0, 1, 2]);
    }
}
