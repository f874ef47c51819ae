//! Multi-source combinators (§4.3.7): `and`, `or`, `xor`, `except` over N
//! change-set streams of the same `(K, V)` shape.

use crate::cache::materialized::MaterializedKeyedStage;
use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::pipeline::ChangeSetSource;
use crate::reactive::{Observer, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CombinatorOp {
    /// Present in every source.
    And,
    /// Present in at least one source.
    Or,
    /// Present in an odd number of sources.
    Xor,
    /// Present in the first source and none of the rest.
    Except,
}

/// Where more than one source holds a key, the published value is taken
/// from the lowest-indexed live source that has it — a deterministic
/// tie-break since set-combinator semantics don't otherwise prefer one
/// source's value over another's. Removed sources leave a `None` slot
/// behind (§4.3.7, "removing a source at runtime") rather than shifting
/// every later source's index, since [`SourceTap`] captures its index once
/// at subscribe time.
fn resolve<K: Eq + Hash, V: Clone>(key: &K, mirrors: &[Option<HashMap<K, V>>], op: CombinatorOp) -> Option<V> {
    let live: Vec<&HashMap<K, V>> = mirrors.iter().filter_map(|m| m.as_ref()).collect();
    let count = live.iter().filter(|m| m.contains_key(key)).count();
    let matches = match op {
        CombinatorOp::And => count == live.len() && count > 0,
        CombinatorOp::Or => count > 0,
        CombinatorOp::Xor => count % 2 == 1,
        CombinatorOp::Except => mirrors.first().and_then(|m| m.as_ref()).is_some_and(|m| m.contains_key(key)) && mirrors[1..].iter().filter_map(|m| m.as_ref()).all(|m| !m.contains_key(key)),
    };
    if !matches {
        return None;
    }
    live.iter().find_map(|m| m.get(key).cloned())
}

pub struct Combinator<K, V> {
    op: CombinatorOp,
    sources: Mutex<Vec<Option<Arc<dyn ChangeSetSource<K, V>>>>>,
    mirrors: Mutex<Vec<Option<HashMap<K, V>>>>,
    stage: MaterializedKeyedStage<K, V>,
    subscriptions: Mutex<Vec<Option<Subscription<ChangeSet<K, V>>>>>,
}

struct SourceTap<K, V> {
    index: usize,
    parent: Arc<Combinator<K, V>>,
}

impl<K, V> Observer<ChangeSet<K, V>> for SourceTap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, item: &ChangeSet<K, V>) {
        self.parent.on_source_next(self.index, item);
    }

    fn on_error(&self, error: &Error) {
        self.parent.stage.on_error(error);
    }

    fn on_completed(&self) {}
}

impl<K, V> Combinator<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(op: CombinatorOp, sources: Vec<Arc<dyn ChangeSetSource<K, V>>>) -> Arc<Self> {
        let this = Arc::new(Combinator { op, sources: Mutex::new(Vec::new()), mirrors: Mutex::new(Vec::new()), stage: MaterializedKeyedStage::new(), subscriptions: Mutex::new(Vec::new()) });
        for source in sources {
            this.add_source(source);
        }
        this
    }

    /// Subscribes an additional source at runtime, appended after the
    /// existing (live or removed) slots. Returns a handle for
    /// [`Self::remove_source`].
    pub fn add_source(self: &Arc<Self>, source: Arc<dyn ChangeSetSource<K, V>>) -> usize {
        let index = {
            let mut sources = self.sources.lock();
            sources.push(Some(source.clone()));
            self.mirrors.lock().push(Some(HashMap::new()));
            sources.len() - 1
        };
        let subscription = source.connect(Arc::new(SourceTap { index, parent: self.clone() }));
        self.subscriptions.lock().push(Some(subscription));
        index
    }

    /// Unsubscribes source `index` at runtime (§4.3.7) and emits the
    /// downstream removals/updates that follow from it no longer
    /// contributing any keys.
    pub fn remove_source(&self, index: usize) {
        let removed_mirror = {
            let mut mirrors = self.mirrors.lock();
            match mirrors.get_mut(index) {
                Some(slot) => slot.take(),
                None => return,
            }
        };
        self.sources.lock()[index] = None;
        self.subscriptions.lock()[index] = None; // Subscription::drop disposes it.
        let Some(removed_mirror) = removed_mirror else { return };

        let mirrors = self.mirrors.lock();
        let mut records = Vec::new();
        for key in removed_mirror.keys() {
            let resolved = resolve(key, &mirrors, self.op);
            match (resolved, self.stage.get(key)) {
                (Some(current), Some(previous)) => records.push(Change::Update { key: key.clone(), current, previous, current_index: None, previous_index: None }),
                (Some(current), None) => records.push(Change::Add { key: key.clone(), current, current_index: None }),
                (None, Some(previous)) => records.push(Change::Remove { key: key.clone(), previous, previous_index: None }),
                (None, None) => {}
            }
        }
        drop(mirrors);
        for record in &records {
            self.stage.apply(&ChangeSet::single(record.clone()));
        }
        if let Some(change_set) = ChangeSet::from_records(records) {
            tracing::trace!(total = change_set.total(), op = ?self.op, "combinator emitted after remove_source");
            self.stage.emit(&change_set);
        }
    }

    fn on_source_next(&self, index: usize, change_set: &ChangeSet<K, V>) {
        let mut mirrors = self.mirrors.lock();
        if !matches!(mirrors.get(index), Some(Some(_))) {
            return;
        }
        let mut records = Vec::new();
        for record in change_set.records() {
            let key = record.key().clone();
            match record.current() {
                Some(current) => {
                    mirrors[index].as_mut().expect("checked live above").insert(key.clone(), current.clone());
                }
                None => {
                    mirrors[index].as_mut().expect("checked live above").remove(&key);
                }
            }
            let resolved = resolve(&key, &mirrors, self.op);
            match (resolved, self.stage.get(&key)) {
                (Some(current), Some(previous)) => records.push(Change::Update { key, current, previous, current_index: None, previous_index: None }),
                (Some(current), None) => records.push(Change::Add { key, current, current_index: None }),
                (None, Some(previous)) => records.push(Change::Remove { key, previous, previous_index: None }),
                (None, None) => {}
            }
        }
        drop(mirrors);
        for record in &records {
            self.stage.apply(&ChangeSet::single(record.clone()));
        }
        if let Some(change_set) = ChangeSet::from_records(records) {
            tracing::trace!(total = change_set.total(), op = ?self.op, "combinator emitted");
            self.stage.emit(&change_set);
        }
    }
}

impl<K, V> ChangeSetSource<K, V> for Combinator<K, V>
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
    fn and_requires_presence_in_every_source() {
        let a = SourceCache::new(|v: &i32| *v);
        let b = SourceCache::new(|v: &i32| *v);
        a.add_or_update_many([1, 2, 3]);
        b.add_or_update_many([2, 3, 4]);
        let and = Combinator::new(CombinatorOp::And, vec![a.clone(), b.clone()]);
        let recorder = RecordingObserver::new();
        let _sub = and.connect(recorder.as_observer());
        assert_eq!(and.stage.len(), 2); // {2, 3}

        a.remove(&2);
        assert_eq!(and.stage.len(), 1);
    }

    #[test]
    fn except_excludes_anything_in_the_other_sources() {
        let a = SourceCache::new(|v: &i32| *v);
        let b = SourceCache::new(|v: &i32| *v);
        a.add_or_update_many([1, 2, 3]);
        b.add_or_update_many([2]);
        let except = Combinator::new(CombinatorOp::Except, vec![a.clone(), b.clone()]);
        let recorder = RecordingObserver::new();
        let _sub = except.connect(recorder.as_observer());
        assert_eq!(except.stage.len(), 2); // {1, 3}
    }

    #[test]
    fn or_updates_after_add_and_remove_source_at_runtime() {
        let a = SourceCache::new(|v: &i32| *v);
        a.add_or_update_many([1, 2]);
        let or = Combinator::new(CombinatorOp::Or, vec![a.clone()]);
        let recorder = RecordingObserver::new();
        let _sub = or.connect(recorder.as_observer());
        assert_eq!(or.stage.len(), 2); // {1, 2}

        let b = SourceCache::new(|v: &i32| *v);
        b.add_or_update_many([3]);
        let b_index = or.add_source(b.clone());
        assert_eq!(or.stage.len(), 3); // {1, 2, 3}

        or.remove_source(b_index);
        assert_eq!(or.stage.len(), 2); // back to {1, 2}
        assert!(!or.stage.contains(&3));
    }
}
