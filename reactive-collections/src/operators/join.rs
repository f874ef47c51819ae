//! Joins (§4.3.6): inner/left/right/full over two keyed streams connected
//! by a left → right foreign-key selector. Missing-side semantics are
//! carried by `Option`, per spec.md's "Optional" carrier.

use crate::cache::materialized::MaterializedKeyedStage;
use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::pipeline::ChangeSetSource;
use crate::reactive::{Observer, Subscription};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

/// The downstream key for a joined row: anchored on the left item that
/// produced it, or — for right/full joins only — on an unmatched right
/// item that has no referencing left row yet.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum JoinKey<LK, RK> {
    Left(LK),
    Right(RK),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    Inner,
    Left,
    Right,
    Full,
}

impl Mode {
    fn emits_right_only_rows(self) -> bool {
        matches!(self, Mode::Right | Mode::Full)
    }
}

type Combiner<L, R, Out> = Arc<dyn Fn(Option<&L>, Option<&R>) -> Option<Out> + Send + Sync>;

pub struct Join<LK, L, RK, R, Out> {
    left_upstream: Arc<dyn ChangeSetSource<LK, L>>,
    right_upstream: Arc<dyn ChangeSetSource<RK, R>>,
    foreign_key: Arc<dyn Fn(&L) -> RK + Send + Sync>,
    combine: Combiner<L, R, Out>,
    mode: Mode,
    left_mirror: Mutex<HashMap<LK, L>>,
    right_mirror: Mutex<HashMap<RK, R>>,
    left_fk: Mutex<HashMap<LK, RK>>,
    right_refs: Mutex<HashMap<RK, HashSet<LK>>>,
    stage: MaterializedKeyedStage<JoinKey<LK, RK>, Out>,
    left_subscription: Mutex<Option<Subscription<ChangeSet<LK, L>>>>,
    right_subscription: Mutex<Option<Subscription<ChangeSet<RK, R>>>>,
}

impl<LK, L, RK, R, Out> Join<LK, L, RK, R, Out>
where
    LK: Eq + Hash + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    RK: Eq + Hash + Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    fn build(
        left_upstream: Arc<dyn ChangeSetSource<LK, L>>,
        right_upstream: Arc<dyn ChangeSetSource<RK, R>>,
        foreign_key: impl Fn(&L) -> RK + Send + Sync + 'static,
        combine: Combiner<L, R, Out>,
        mode: Mode,
    ) -> Arc<Self> {
        let this = Arc::new(Join {
            left_upstream,
            right_upstream,
            foreign_key: Arc::new(foreign_key),
            combine,
            mode,
            left_mirror: Mutex::new(HashMap::new()),
            right_mirror: Mutex::new(HashMap::new()),
            left_fk: Mutex::new(HashMap::new()),
            right_refs: Mutex::new(HashMap::new()),
            stage: MaterializedKeyedStage::new(),
            left_subscription: Mutex::new(None),
            right_subscription: Mutex::new(None),
        });
        let left_sub = this.left_upstream.connect(this.clone());
        let right_sub = this.right_upstream.connect(this.clone());
        *this.left_subscription.lock() = Some(left_sub);
        *this.right_subscription.lock() = Some(right_sub);
        this
    }

    /// Inner join: a row is emitted only while both sides are present.
    pub fn inner(left: Arc<dyn ChangeSetSource<LK, L>>, right: Arc<dyn ChangeSetSource<RK, R>>, foreign_key: impl Fn(&L) -> RK + Send + Sync + 'static, combine: impl Fn(&L, &R) -> Out + Send + Sync + 'static) -> Arc<Self> {
        let combine = Arc::new(move |l: Option<&L>, r: Option<&R>| match (l, r) {
            (Some(l), Some(r)) => Some(combine(l, r)),
            _ => None,
        });
        Self::build(left, right, foreign_key, combine, Mode::Inner)
    }

    /// Left join: every left row is always emitted; `r` is `None` while
    /// unmatched.
    pub fn left(left: Arc<dyn ChangeSetSource<LK, L>>, right: Arc<dyn ChangeSetSource<RK, R>>, foreign_key: impl Fn(&L) -> RK + Send + Sync + 'static, combine: impl Fn(&L, Option<&R>) -> Out + Send + Sync + 'static) -> Arc<Self> {
        let combine = Arc::new(move |l: Option<&L>, r: Option<&R>| l.map(|l| combine(l, r)));
        Self::build(left, right, foreign_key, combine, Mode::Left)
    }

    /// Right join: every right row is always emitted (anchored on its own
    /// key when unmatched); `l` is `None` while unmatched.
    pub fn right(left: Arc<dyn ChangeSetSource<LK, L>>, right: Arc<dyn ChangeSetSource<RK, R>>, foreign_key: impl Fn(&L) -> RK + Send + Sync + 'static, combine: impl Fn(Option<&L>, &R) -> Out + Send + Sync + 'static) -> Arc<Self> {
        let combine = Arc::new(move |l: Option<&L>, r: Option<&R>| r.map(|r| combine(l, r)));
        Self::build(left, right, foreign_key, combine, Mode::Right)
    }

    /// Full join: a row is emitted as long as either side is present.
    pub fn full(left: Arc<dyn ChangeSetSource<LK, L>>, right: Arc<dyn ChangeSetSource<RK, R>>, foreign_key: impl Fn(&L) -> RK + Send + Sync + 'static, combine: impl Fn(Option<&L>, Option<&R>) -> Out + Send + Sync + 'static) -> Arc<Self> {
        Self::build(left, right, foreign_key, Arc::new(combine), Mode::Full)
    }

    fn recompute(&self, key: JoinKey<LK, RK>, l: Option<&L>, r: Option<&R>, records: &mut Vec<Change<JoinKey<LK, RK>, Out>>) {
        match ((self.combine)(l, r), self.stage.get(&key)) {
            (Some(current), Some(previous)) => records.push(Change::Update { key, current, previous, current_index: None, previous_index: None }),
            (Some(current), None) => records.push(Change::Add { key, current, current_index: None }),
            (None, Some(previous)) => records.push(Change::Remove { key, previous, previous_index: None }),
            (None, None) => {}
        }
    }

    fn publish(&self, records: Vec<Change<JoinKey<LK, RK>, Out>>) {
        for record in &records {
            self.stage.apply(&ChangeSet::single(record.clone()));
        }
        if let Some(change_set) = ChangeSet::from_records(records) {
            tracing::trace!(total = change_set.total(), "join emitted");
            self.stage.emit(&change_set);
        }
    }
}

impl<LK, L, RK, R, Out> Observer<ChangeSet<LK, L>> for Join<LK, L, RK, R, Out>
where
    LK: Eq + Hash + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    RK: Eq + Hash + Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<LK, L>) {
        let mut left_mirror = self.left_mirror.lock();
        let right_mirror = self.right_mirror.lock();
        let mut left_fk = self.left_fk.lock();
        let mut right_refs = self.right_refs.lock();
        let mut records = Vec::new();

        for record in upstream_set.records() {
            let lk = record.key().clone();
            match record {
                Change::Remove { .. } => {
                    left_mirror.remove(&lk);
                    if let Some(old_fk) = left_fk.remove(&lk) {
                        if let Some(refs) = right_refs.get_mut(&old_fk) {
                            refs.remove(&lk);
                            if refs.is_empty() && self.mode.emits_right_only_rows() {
                                if let Some(r) = right_mirror.get(&old_fk) {
                                    self.recompute(JoinKey::Right(old_fk.clone()), None, Some(r), &mut records);
                                }
                            }
                        }
                    }
                    self.recompute(JoinKey::Left(lk), None, None, &mut records);
                }
                _ => {
                    let current = record.current().expect("non-Remove records always carry a current value").clone();
                    let new_fk = (self.foreign_key)(&current);
                    let old_fk = left_fk.get(&lk).cloned();
                    if old_fk.as_ref() != Some(&new_fk) {
                        if let Some(old_fk) = &old_fk {
                            if let Some(refs) = right_refs.get_mut(old_fk) {
                                refs.remove(&lk);
                                if refs.is_empty() && self.mode.emits_right_only_rows() {
                                    if let Some(r) = right_mirror.get(old_fk) {
                                        self.recompute(JoinKey::Right(old_fk.clone()), None, Some(r), &mut records);
                                    }
                                }
                            }
                        }
                        let refs = right_refs.entry(new_fk.clone()).or_default();
                        let was_empty = refs.is_empty();
                        refs.insert(lk.clone());
                        if was_empty && self.mode.emits_right_only_rows() && right_mirror.contains_key(&new_fk) {
                            self.recompute(JoinKey::Right(new_fk.clone()), None, None, &mut records);
                        }
                        left_fk.insert(lk.clone(), new_fk.clone());
                    }
                    left_mirror.insert(lk.clone(), current.clone());
                    let r = right_mirror.get(&new_fk);
                    self.recompute(JoinKey::Left(lk), Some(&current), r, &mut records);
                }
            }
        }

        drop(left_mirror);
        drop(right_mirror);
        drop(left_fk);
        drop(right_refs);
        self.publish(records);
    }

    fn on_error(&self, error: &Error) {
        self.stage.on_error(error);
    }

    fn on_completed(&self) {
        self.stage.on_completed();
    }
}

impl<LK, L, RK, R, Out> Observer<ChangeSet<RK, R>> for Join<LK, L, RK, R, Out>
where
    LK: Eq + Hash + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    RK: Eq + Hash + Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<RK, R>) {
        let left_mirror = self.left_mirror.lock();
        let mut right_mirror = self.right_mirror.lock();
        let right_refs = self.right_refs.lock();
        let mut records = Vec::new();

        for record in upstream_set.records() {
            let rk = record.key().clone();
            let referencing = right_refs.get(&rk).cloned().unwrap_or_default();
            match record {
                Change::Remove { .. } => {
                    right_mirror.remove(&rk);
                    if referencing.is_empty() {
                        self.recompute(JoinKey::Right(rk), None, None, &mut records);
                    } else {
                        for lk in &referencing {
                            let l = left_mirror.get(lk);
                            self.recompute(JoinKey::Left(lk.clone()), l, None, &mut records);
                        }
                    }
                }
                _ => {
                    let current = record.current().expect("non-Remove records always carry a current value").clone();
                    right_mirror.insert(rk.clone(), current.clone());
                    if referencing.is_empty() {
                        if self.mode.emits_right_only_rows() {
                            self.recompute(JoinKey::Right(rk), None, Some(&current), &mut records);
                        }
                    } else {
                        for lk in &referencing {
                            let l = left_mirror.get(lk);
                            self.recompute(JoinKey::Left(lk.clone()), l, Some(&current), &mut records);
                        }
                    }
                }
            }
        }

        drop(left_mirror);
        drop(right_mirror);
        drop(right_refs);
        self.publish(records);
    }

    fn on_error(&self, error: &Error) {
        self.stage.on_error(error);
    }

    fn on_completed(&self) {
        self.stage.on_completed();
    }
}

impl<LK, L, RK, R, Out> ChangeSetSource<JoinKey<LK, RK>, Out> for Join<LK, L, RK, R, Out>
where
    LK: Eq + Hash + Clone + Send + Sync + 'static,
    L: Clone + Send + Sync + 'static,
    RK: Eq + Hash + Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<JoinKey<LK, RK>, Out>>>) -> Subscription<ChangeSet<JoinKey<LK, RK>, Out>> {
        self.stage.connect(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::test_support::RecordingObserver;

    #[derive(Clone, Debug, PartialEq)]
    struct Device {
        name: &'static str,
    }

    #[derive(Clone, Debug, PartialEq)]
    struct DeviceMeta {
        name: &'static str,
        description: &'static str,
    }

    #[test]
    fn inner_join_scenario() {
        let left = SourceCache::new(|d: &Device| d.name);
        let right = SourceCache::new(|m: &DeviceMeta| m.name);
        left.edit(|e| {
            e.add_or_update(Device { name: "D1" });
            e.add_or_update(Device { name: "D2" });
            e.add_or_update(Device { name: "D3" });
        });

        let joined = Join::inner(left.clone(), right.clone(), |d: &Device| d.name, |d: &Device, m: &DeviceMeta| (d.name, m.description));
        let recorder = RecordingObserver::new();
        let _sub = joined.connect(recorder.as_observer());
        assert!(recorder.items().is_empty()); // no matches yet

        right.edit(|e| {
            e.add_or_update(DeviceMeta { name: "D1", description: "one" });
            e.add_or_update(DeviceMeta { name: "D2", description: "two" });
        });
        assert_eq!(recorder.items()[0].adds(), 2);

        right.remove(&"D1");
        assert_eq!(recorder.items()[1].removes(), 1);
    }
}
