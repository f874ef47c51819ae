use crate::change::{ListChange, ListChangeSet};
use crate::error::Error;
use crate::reactive::{Observer, Subject, Subscription};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::Arc;

/// The indexed counterpart of [`crate::cache::materialized::MaterializedKeyedStage`]:
/// a positional mirror plus the subject that publishes it. Embedded by
/// [`crate::list::SourceList`] and by every list operator.
pub struct MaterializedIndexedStage<T> {
    state: RwLock<Vec<T>>,
    subject: Subject<ListChangeSet<T>>,
}

impl<T> Default for MaterializedIndexedStage<T> {
    fn default() -> Self {
        MaterializedIndexedStage { state: RwLock::new(Vec::new()), subject: Subject::new() }
    }
}

impl<T> MaterializedIndexedStage<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn raw_write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.state.write()
    }

    pub(crate) fn subscribe_raw(&self, observer: Arc<dyn Observer<ListChangeSet<T>>>) -> Subscription<ListChangeSet<T>> {
        self.subject.subscribe(observer)
    }

    pub fn connect(&self, observer: Arc<dyn Observer<ListChangeSet<T>>>) -> Subscription<ListChangeSet<T>> {
        let initial = self.state.read().clone();
        if !initial.is_empty() {
            let change_set = ListChangeSet::single(ListChange::AddRange { index: 0, items: initial });
            observer.on_next(&change_set);
        }
        self.subject.subscribe(observer)
    }

    /// Applies `change_set` to the mirror in record order.
    pub fn apply(&self, change_set: &ListChangeSet<T>) {
        let mut guard = self.state.write();
        for record in change_set.records() {
            match record {
                ListChange::Add { index, item } => guard.insert(*index, item.clone()),
                ListChange::AddRange { index, items } => {
                    for (offset, item) in items.iter().enumerate() {
                        guard.insert(index + offset, item.clone());
                    }
                }
                ListChange::Replace { index, current, .. } => guard[*index] = current.clone(),
                ListChange::Remove { index, .. } => {
                    guard.remove(*index);
                }
                ListChange::RemoveRange { index, items } => {
                    guard.drain(*index..*index + items.len());
                }
                ListChange::Moved { previous_index, current_index, item } => {
                    guard.remove(*previous_index);
                    guard.insert(*current_index, item.clone());
                }
                ListChange::Refresh { index, item } => guard[*index] = item.clone(),
                ListChange::Clear { .. } => guard.clear(),
            }
        }
    }

    pub fn emit(&self, change_set: &ListChangeSet<T>) {
        self.subject.on_next(change_set);
    }

    pub fn on_error(&self, error: &Error) {
        self.subject.on_error(error);
    }

    pub fn on_completed(&self) {
        self.subject.on_completed();
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.state.read().clone()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.state.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
