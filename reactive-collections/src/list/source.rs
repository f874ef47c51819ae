use crate::change::ListChangeSet;
use crate::error::Error;
use crate::list::editor::ListEditor;
use crate::list::materialized::MaterializedIndexedStage;
use crate::pipeline::ListChangeSetSource;
use crate::reactive::{Observer, Subscription};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const NO_COUNT_PUBLISHED: usize = usize::MAX;

/// C4 — the single-writer edit surface for an indexed (ordered) collection
/// (§4.2). Duplicates are allowed; there is no key.
pub struct SourceList<T> {
    stage: MaterializedIndexedStage<T>,
    revision: AtomicU64,
    count_subject: crate::reactive::Subject<usize>,
    last_published_count: AtomicUsize,
}

impl<T> SourceList<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(SourceList {
            stage: MaterializedIndexedStage::new(),
            revision: AtomicU64::new(0),
            count_subject: crate::reactive::Subject::new(),
            last_published_count: AtomicUsize::new(NO_COUNT_PUBLISHED),
        })
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn edit<R>(&self, f: impl FnOnce(&mut ListEditor<'_, T>) -> R) -> R {
        let mut records = Vec::new();
        let result;
        {
            let mut guard = self.stage.raw_write();
            let mut editor = ListEditor { data: &mut guard, records: &mut records };
            result = f(&mut editor);
        }
        self.commit(ListChangeSet::from_records(records));
        result
    }

    pub fn try_edit<R>(&self, f: impl FnOnce(&mut ListEditor<'_, T>) -> anyhow::Result<R>) -> anyhow::Result<R> {
        let mut records = Vec::new();
        let result;
        {
            let mut guard = self.stage.raw_write();
            let mut editor = ListEditor { data: &mut guard, records: &mut records };
            result = f(&mut editor);
        }
        self.commit(ListChangeSet::from_records(records));
        if let Err(error) = &result {
            tracing::warn!(%error, "edit closure failed; terminating subscribers");
            self.stage.on_error(&Error::UserFn(anyhow::anyhow!("{error}")));
        }
        result
    }

    fn commit(&self, change_set: Option<ListChangeSet<T>>) {
        if let Some(change_set) = change_set {
            self.revision.fetch_add(1, Ordering::AcqRel);
            tracing::trace!(total = change_set.total(), "list edit committed");
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

    pub fn add(&self, item: T) {
        self.edit(|editor| editor.add(item));
    }

    pub fn add_range(&self, items: Vec<T>, index: Option<usize>) {
        self.edit(|editor| editor.add_range(items, index));
    }

    pub fn insert(&self, index: usize, item: T) {
        self.edit(|editor| editor.insert(index, item));
    }

    pub fn replace_at(&self, index: usize, new: T) {
        self.edit(|editor| editor.replace_at(index, new));
    }

    pub fn replace_item(&self, old: &T, new: T)
    where
        T: PartialEq,
    {
        self.edit(|editor| editor.replace_item(old, new));
    }

    pub fn remove_at(&self, index: usize) {
        self.edit(|editor| {
            editor.remove_at(index);
        });
    }

    pub fn remove(&self, item: &T)
    where
        T: PartialEq,
    {
        self.edit(|editor| editor.remove(item));
    }

    pub fn remove_range(&self, index: usize, count: usize) {
        self.edit(|editor| editor.remove_range(index, count));
    }

    pub fn move_item(&self, from: usize, to: usize) {
        self.edit(|editor| editor.move_item(from, to));
    }

    pub fn clear(&self) {
        self.edit(|editor| editor.clear());
    }

    pub fn refresh_at(&self, index: usize) {
        self.edit(|editor| editor.refresh_at(index));
    }

    pub fn refresh_item(&self, item: &T)
    where
        T: PartialEq,
    {
        self.edit(|editor| editor.refresh_item(item));
    }

    pub fn items(&self) -> Vec<T> {
        self.stage.snapshot()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.stage.get(index)
    }

    pub fn count(&self) -> usize {
        self.stage.len()
    }

    pub fn count_changed(&self, observer: Arc<dyn Observer<usize>>) -> Subscription<usize> {
        let count = self.stage.len();
        observer.on_next(&count);
        self.count_subject.subscribe(observer)
    }
}

impl<T> ListChangeSetSource<T> for SourceList<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ListChangeSet<T>>>) -> Subscription<ListChangeSet<T>> {
        self.stage.connect(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingObserver;

    #[test]
    fn initial_batch_then_incremental_edits() {
        let list = SourceList::<i32>::new();
        list.add(1);
        list.add(2);
        let recorder = RecordingObserver::new();
        let _sub = list.connect(recorder.as_observer());
        list.insert(1, 99);
        let batches = recorder.items();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].total(), 2); // initial AddRange
        assert_eq!(batches[1].total(), 1);
        assert_eq!(list.items(), vec![1, 99, 2]);
    }

    #[test]
    fn move_preserves_identity() {
        let list = SourceList::<&'static str>::new();
        list.add_range(vec!["a", "b", "c"], None);
        list.move_item(0, 2);
        assert_eq!(list.items(), vec!["b", "c", "a"]);
    }

    #[test]
    fn replace_and_refresh_by_item_locate_their_own_index() {
        let list = SourceList::<&'static str>::new();
        list.add_range(vec!["a", "b", "c"], None);
        let recorder = RecordingObserver::new();
        let _sub = list.connect(recorder.as_observer());

        list.replace_item(&"b", "bb");
        assert_eq!(list.items(), vec!["a", "bb", "c"]);

        list.refresh_item(&"c");
        let batches = recorder.items();
        assert_eq!(batches.last().unwrap().refreshes(), 1);
    }
}
