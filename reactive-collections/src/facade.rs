//! The public facade (§2, "Public facade"; §6, "Public entry points"): a
//! fluent pipeline surface over the operator kernel so a consumer composes
//! `source.filter(..).sort(..).page(..)` without naming each operator
//! struct and threading `Arc<dyn ChangeSetSource<_, _>>` by hand.
//!
//! Every method here is a thin, no-state-of-its-own wrapper around the
//! corresponding operator's own `new`/constructor — this module adds
//! nothing but chaining ergonomics, the same role
//! `artifice`'s builder-style extension traits play over its lower-level
//! evaluation types.

use crate::aggregate::Aggregate;
use crate::bind::{BindTarget, Binder};
use crate::change::ChangeSet;
use crate::operators::batch::{Batch, BatchPolicy, DeferUntilLoaded, NotEmpty, SkipInitial};
use crate::operators::bounded::{ExpireAfter, LimitSizeTo};
use crate::operators::dispose::DisposeMany;
use crate::operators::distinct::Distinct;
use crate::operators::filter::{DynamicFilter, Filter};
use crate::operators::group::Group;
use crate::operators::join::Join;
use crate::operators::page::{Page, Window};
use crate::operators::sort::Sort;
use crate::operators::transform::{Transform, TransformImmutable};
use crate::pipeline::{ChangeSetSource, SortedChangeSetSource};
use std::cmp::Ordering;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Fluent combinators over any keyed change-set source — a source cache or
/// any operator downstream of one (§6, "Public entry points").
pub trait ChangeSetSourcePipeline<K, V>: ChangeSetSource<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn filter(self: Arc<Self>, predicate: impl Fn(&V) -> bool + Send + Sync + 'static) -> Arc<Filter<K, V>>
    where
        Self: Sized + 'static,
    {
        Filter::new(self, predicate)
    }

    fn dynamic_filter(self: Arc<Self>, predicate: impl Fn(&V) -> bool + Send + Sync + 'static) -> Arc<DynamicFilter<K, V>>
    where
        Self: Sized + 'static,
    {
        DynamicFilter::new(self, predicate)
    }

    fn transform<D>(self: Arc<Self>, f: impl Fn(&V) -> D + Send + Sync + 'static) -> Arc<Transform<K, V, D>>
    where
        Self: Sized + 'static,
        D: Clone + Send + Sync + 'static,
    {
        Transform::new(self, f)
    }

    /// The "immutable" keyed transform variant (§4.3.2): a Refresh forwards
    /// the already-computed destination as `Refresh` instead of re-running
    /// `f` and emitting `Update`.
    fn transform_immutable<D>(self: Arc<Self>, f: impl Fn(&V) -> D + Send + Sync + 'static) -> Arc<TransformImmutable<K, V, D>>
    where
        Self: Sized + 'static,
        D: Clone + Send + Sync + 'static,
    {
        TransformImmutable::new(self, f)
    }

    fn sort(self: Arc<Self>, comparator: impl Fn(&V, &V) -> Ordering + Send + Sync + 'static, reset_threshold: i64, treat_moves_as_remove_add: bool) -> Arc<Sort<K, V>>
    where
        Self: Sized + 'static,
    {
        Sort::new(self, comparator, reset_threshold, treat_moves_as_remove_add)
    }

    fn group_by<G>(self: Arc<Self>, group_key: impl Fn(&V) -> G + Send + Sync + 'static) -> Arc<Group<K, V, G>>
    where
        Self: Sized + 'static,
        G: Eq + Hash + Clone + Send + Sync + 'static,
    {
        Group::new(self, group_key)
    }

    fn distinct_by<D>(self: Arc<Self>, selector: impl Fn(&V) -> D + Send + Sync + 'static) -> Arc<Distinct<K, V, D>>
    where
        Self: Sized + 'static,
        D: Eq + Hash + Clone + Send + Sync + 'static,
    {
        Distinct::new(self, selector)
    }

    fn aggregate(self: Arc<Self>, selector: impl Fn(&V) -> f64 + Send + Sync + 'static) -> Arc<Aggregate<K, V>>
    where
        Self: Sized + 'static,
    {
        Aggregate::new(self, selector)
    }

    fn limit_size_to(self: Arc<Self>, limit: usize) -> Arc<LimitSizeTo<K, V>>
    where
        Self: Sized + 'static,
    {
        LimitSizeTo::new(self, limit)
    }

    fn expire_after(self: Arc<Self>, ttl: impl Fn(&V) -> Duration + Send + Sync + 'static, poll: Duration) -> Arc<ExpireAfter<K, V>>
    where
        Self: Sized + 'static,
    {
        ExpireAfter::new(self, ttl, poll)
    }

    fn batch(self: Arc<Self>, policy: BatchPolicy) -> Arc<Batch<K, V>>
    where
        Self: Sized + 'static,
    {
        Batch::new(self, policy)
    }

    fn defer_until_loaded(self: Arc<Self>) -> Arc<DeferUntilLoaded<K, V>>
    where
        Self: Sized + 'static,
    {
        DeferUntilLoaded::new(self)
    }

    fn skip_initial(self: Arc<Self>) -> Arc<SkipInitial<K, V>>
    where
        Self: Sized + 'static,
    {
        SkipInitial::new(self)
    }

    fn not_empty(self: Arc<Self>) -> Arc<NotEmpty<K, V>>
    where
        Self: Sized + 'static,
    {
        NotEmpty::new(self)
    }

    /// Terminal release hook (§3, "Lifecycle"): invokes `release` exactly
    /// once per item leaving the collection.
    fn dispose_many(self: Arc<Self>, release: impl Fn(&K, &V) + Send + Sync + 'static) -> Arc<DisposeMany<K, V>>
    where
        Self: Sized + 'static,
    {
        DisposeMany::new(self, release)
    }

    fn inner_join<RK, R, Out>(self: Arc<Self>, right: Arc<dyn ChangeSetSource<RK, R>>, foreign_key: impl Fn(&V) -> RK + Send + Sync + 'static, combine: impl Fn(&V, &R) -> Out + Send + Sync + 'static) -> Arc<Join<K, V, RK, R, Out>>
    where
        Self: Sized + 'static,
        RK: Eq + Hash + Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
        Out: Clone + Send + Sync + 'static,
    {
        Join::inner(self, right, foreign_key, combine)
    }

    fn left_join<RK, R, Out>(self: Arc<Self>, right: Arc<dyn ChangeSetSource<RK, R>>, foreign_key: impl Fn(&V) -> RK + Send + Sync + 'static, combine: impl Fn(&V, Option<&R>) -> Out + Send + Sync + 'static) -> Arc<Join<K, V, RK, R, Out>>
    where
        Self: Sized + 'static,
        RK: Eq + Hash + Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
        Out: Clone + Send + Sync + 'static,
    {
        Join::left(self, right, foreign_key, combine)
    }

    /// Materialises a read-only derived cache: erases the concrete
    /// operator chain behind a single trait object (§6,
    /// "as-observable-cache").
    fn as_observable_cache(self: Arc<Self>) -> Arc<dyn ChangeSetSource<K, V>>
    where
        Self: Sized + 'static,
    {
        self
    }

    /// Consumes raw change sets without composing further (§6, "subscribe").
    fn subscribe(self: Arc<Self>, observer: Arc<dyn crate::reactive::Observer<ChangeSet<K, V>>>) -> crate::reactive::Subscription<ChangeSet<K, V>>
    where
        Self: Sized + 'static,
    {
        self.connect(observer)
    }
}

impl<K, V, S> ChangeSetSourcePipeline<K, V> for S
where
    S: ChangeSetSource<K, V> + ?Sized,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
}

/// Fluent combinators over a sorted change-set source (§4.3.3's output,
/// consumed by paging and the binding adapter).
pub trait SortedChangeSetSourcePipeline<K, V>: SortedChangeSetSource<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn page(self: Arc<Self>, window: Window) -> Arc<Page<K, V>>
    where
        Self: Sized + 'static,
    {
        Page::new(self, window)
    }

    /// Drives an external binding target from this sorted stream (§4.4).
    fn bind(self: Arc<Self>, target: Arc<dyn BindTarget<V>>, reset_threshold: i64) -> Arc<Binder<K, V>>
    where
        Self: Sized + 'static,
    {
        Binder::new(self, target, reset_threshold)
    }
}

impl<K, V, S> SortedChangeSetSourcePipeline<K, V> for S
where
    S: SortedChangeSetSource<K, V> + ?Sized,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::test_support::RecordingObserver;

    #[derive(Clone, Debug, PartialEq)]
    struct Person {
        name: &'static str,
        age: u32,
    }

    #[test]
    fn chains_filter_then_sort_fluently() {
        let source = SourceCache::new(|p: &Person| p.name);
        source.add_or_update_many([Person { name: "A", age: 30 }, Person { name: "B", age: 10 }, Person { name: "C", age: 25 }]);

        let pipeline = source.clone().filter(|p: &Person| p.age >= 18).sort(|a: &Person, b: &Person| a.age.cmp(&b.age), crate::operators::sort::NEVER_RESET, false);

        let recorder: RecordingObserver<crate::change::SortedChangeSet<&'static str, Person>> = RecordingObserver::new();
        let _sub = pipeline.connect(recorder.as_observer());
        let initial = &recorder.items()[0];
        assert_eq!(initial.sorted_view.iter().map(|(_, p)| p.name).collect::<Vec<_>>(), vec!["C", "A"]);
    }

    #[test]
    fn as_observable_cache_erases_the_concrete_chain() {
        let source = SourceCache::new(|v: &i32| *v);
        source.add_or_update_many([1, 2, 3]);
        let erased: Arc<dyn ChangeSetSource<i32, i32>> = source.clone().filter(|v: &i32| *v > 1).as_observable_cache();
        let recorder = RecordingObserver::new();
        let _sub = erased.connect(recorder.as_observer());
        assert_eq!(recorder.items()[0].total(), 2);
    }
}
