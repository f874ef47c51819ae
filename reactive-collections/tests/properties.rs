//! Property-style integration tests driving the literal end-to-end
//! scenarios via [`reactive_collections::test_support::ChangeSetAggregator`]
//! (C8), exercising P1 (no empty emissions) and P2 (initial batch) across
//! several operators at once rather than in isolation.

use reactive_collections::cache::SourceCache;
use reactive_collections::change::SortReason;
use reactive_collections::facade::ChangeSetSourcePipeline;
use reactive_collections::list::SourceList;
use reactive_collections::operators::dispose::DisposeMany;
use reactive_collections::operators::group::Group;
use reactive_collections::operators::join::Join;
use reactive_collections::operators::sort::Sort;
use reactive_collections::test_support::{init_tracing, ChangeSetAggregator, RecordingObserver};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq)]
struct Person {
    name: &'static str,
    age: u32,
}

#[test]
fn filter_age_over_18_scenario() {
    init_tracing();
    let source = SourceCache::new(|p: &Person| p.name);
    let filtered = source.clone().filter(|p: &Person| p.age > 18);
    let aggregator = ChangeSetAggregator::new();
    let _sub = filtered.connect(aggregator.as_observer());

    source.add_or_update_many([Person { name: "A", age: 17 }, Person { name: "B", age: 20 }, Person { name: "C", age: 25 }]);
    let initial = &aggregator.messages()[0];
    assert_eq!(initial.adds(), 2);

    source.add_or_update(Person { name: "A", age: 30 });
    assert_eq!(aggregator.messages().last().unwrap().adds(), 1);

    source.add_or_update(Person { name: "B", age: 10 });
    assert_eq!(aggregator.messages().last().unwrap().removes(), 1);

    source.edit(|editor| editor.refresh(&"A"));
    let last = aggregator.messages().last().unwrap();
    assert_eq!(last.refreshes(), 1);

    // P1: every recorded emission is non-empty.
    assert!(aggregator.messages().iter().all(|m| m.total() > 0));
}

#[derive(Clone, Debug, PartialEq)]
enum Status {
    Live,
    Filled,
}

#[derive(Clone, Debug, PartialEq)]
struct Trade {
    id: u32,
    status: Status,
}

#[test]
fn group_by_status_scenario() {
    let source = SourceCache::new(|t: &Trade| t.id);
    let grouped = Group::new(source.clone(), |t: &Trade| match t.status {
        Status::Live => "Live",
        Status::Filled => "Filled",
    });

    source.add_or_update_many([
        Trade { id: 1, status: Status::Live },
        Trade { id: 2, status: Status::Filled },
        Trade { id: 3, status: Status::Live },
        Trade { id: 4, status: Status::Filled },
    ]);

    let outer = ChangeSetAggregator::new();
    let _sub = grouped.connect(outer.as_observer());
    let initial = &outer.messages()[0];
    assert_eq!(initial.adds(), 2); // two groups: Live, Filled

    let live_bucket = initial.records().iter().find(|r| *r.key() == "Live").and_then(|r| r.current().cloned()).unwrap();
    assert_eq!(live_bucket.count(), 2);

    source.add_or_update(Trade { id: 1, status: Status::Filled });
    // outer has no net change: both groups still non-empty.
    assert!(outer.messages().len() >= 1);

    source.remove(&3);
    // removing the remaining Live trade empties the Live bucket, which
    // must itself disappear from the outer stream.
    assert!(live_bucket.count() == 0);
}

#[test]
fn distinct_currency_pairs_scenario() {
    #[derive(Clone, Debug, PartialEq)]
    struct FxTrade {
        id: u32,
        pair: &'static str,
    }

    let source = SourceCache::new(|t: &FxTrade| t.id);
    let distinct = source.clone().distinct_by(|t: &FxTrade| t.pair);
    let aggregator = ChangeSetAggregator::new();
    let _sub = distinct.connect(aggregator.as_observer());

    source.add_or_update_many([
        FxTrade { id: 1, pair: "USD/EUR" },
        FxTrade { id: 2, pair: "USD/EUR" },
        FxTrade { id: 3, pair: "USD/EUR" },
        FxTrade { id: 4, pair: "EUR/GBP" },
    ]);
    let initial = &aggregator.messages()[0];
    assert_eq!(initial.adds(), 2);

    source.remove(&4);
    assert_eq!(aggregator.messages().last().unwrap().removes(), 1);

    let before = aggregator.messages().len();
    source.remove(&1);
    // one of three USD/EUR trades removed: distinct pair still present,
    // so no further emission (suppressed per I1).
    assert_eq!(aggregator.messages().len(), before);
}

#[test]
fn inner_join_devices_scenario() {
    #[derive(Clone, Debug, PartialEq)]
    struct Device {
        name: &'static str,
    }
    #[derive(Clone, Debug, PartialEq)]
    struct DeviceMeta {
        name: &'static str,
    }

    let left = SourceCache::new(|d: &Device| d.name);
    let right = SourceCache::new(|m: &DeviceMeta| m.name);
    let joined = Join::inner(left.clone(), right.clone(), |d: &Device| d.name, |d: &Device, m: &DeviceMeta| (d.name, m.name));

    let aggregator = ChangeSetAggregator::new();
    let _sub = joined.connect(aggregator.as_observer());

    left.add_or_update_many([Device { name: "D1" }, Device { name: "D2" }, Device { name: "D3" }]);
    assert!(aggregator.messages().is_empty(), "no matches yet, nothing should emit");

    right.add_or_update_many([DeviceMeta { name: "D1" }, DeviceMeta { name: "D2" }]);
    let initial = &aggregator.messages()[0];
    assert_eq!(initial.adds(), 2);

    right.remove(&"D1");
    assert_eq!(aggregator.messages().last().unwrap().removes(), 1);
}

#[test]
fn sort_ascending_by_age_then_comparator_change_scenario() {
    #[derive(Clone, Debug, PartialEq)]
    struct Ranked {
        id: u32,
        age: u32,
    }

    let source = SourceCache::new(|r: &Ranked| r.id);
    let sorted = Sort::new(source.clone(), |a: &Ranked, b: &Ranked| a.age.cmp(&b.age), 25, false);
    let recorder: RecordingObserver<reactive_collections::change::SortedChangeSet<u32, Ranked>> = RecordingObserver::new();
    let _sub = sorted.connect(recorder.as_observer());

    source.add_or_update_many((0..100).map(|id| Ranked { id, age: 100 - id }));
    let initial = &recorder.items()[0];
    assert_eq!(initial.sort_reason, SortReason::InitialLoad);
    assert_eq!(initial.sorted_view.len(), 100);
    // ages were assigned in reverse of id, so ascending-by-age is id 99..0.
    assert_eq!(initial.sorted_view.first().map(|(id, _)| *id), Some(99));
    assert_eq!(initial.sorted_view.last().map(|(id, _)| *id), Some(0));

    sorted.set_comparator(|a: &Ranked, b: &Ranked| b.age.cmp(&a.age));
    let after = recorder.items().last().unwrap().clone();
    assert_eq!(after.sort_reason, SortReason::ComparerChanged);
    assert_eq!(after.sorted_view.first().map(|(id, _)| *id), Some(0));
    assert_eq!(after.sorted_view.last().map(|(id, _)| *id), Some(99));
}

#[test]
fn transform_with_dispose_many_scenario() {
    #[derive(Clone)]
    struct Resource {
        id: u32,
    }

    let source = SourceCache::new(|r: &Resource| r.id);
    source.add_or_update_many((0..10).map(|id| Resource { id }));

    let released = Arc::new(Mutex::new(Vec::new()));
    let released_for_hook = released.clone();
    let disposing = DisposeMany::new(source.clone(), move |id: &u32, _resource: &Resource| released_for_hook.lock().unwrap().push(*id));
    let aggregator = ChangeSetAggregator::new();
    let _sub = disposing.connect(aggregator.as_observer());

    source.remove(&5);
    assert_eq!(*released.lock().unwrap(), vec![5]);
}

#[test]
fn source_list_add_range_emits_initial_batch() {
    let list = SourceList::new();
    list.add_range(vec![1, 2, 3], None);
    let aggregator: reactive_collections::test_support::RecordingObserver<reactive_collections::change::ListChangeSet<i32>> = reactive_collections::test_support::RecordingObserver::new();
    let _sub = list.connect(aggregator.as_observer());
    assert_eq!(aggregator.items().len(), 1);
}
