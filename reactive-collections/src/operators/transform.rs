//! Transform (§4.3.2): keyed projection, its safe/forced variants, the
//! fan-out-to-children form, and the flat-to-tree pivot.

use crate::cache::materialized::MaterializedKeyedStage;
use crate::change::{Change, ChangeSet};
use crate::error::Error;
use crate::pipeline::ChangeSetSource;
use crate::reactive::{Observer, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

type TransformFn<V, D> = Arc<dyn Fn(&V) -> D + Send + Sync>;

/// Keyed transform (§4.3.2): `V -> D` applied on Add/Update, re-applied on
/// Refresh and emitted downstream as `Update` (the spec's default; see
/// [`TransformImmutable`] for the variant that instead forwards the
/// already-computed destination as `Refresh`).
pub struct Transform<K, V, D> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    transform: Mutex<TransformFn<V, D>>,
    sources: Mutex<HashMap<K, V>>,
    stage: MaterializedKeyedStage<K, D>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V, D> Transform<K, V, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, transform: impl Fn(&V) -> D + Send + Sync + 'static) -> Arc<Self> {
        let this = Arc::new(Transform {
            upstream,
            transform: Mutex::new(Arc::new(transform)),
            sources: Mutex::new(HashMap::new()),
            stage: MaterializedKeyedStage::new(),
            upstream_subscription: Mutex::new(None),
        });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    /// Re-runs the transform over every item whose source currently
    /// satisfies `predicate`, emitting `Update` for each changed result.
    pub fn force_transform_where(&self, predicate: impl Fn(&V) -> bool) {
        let transform = self.transform.lock().clone();
        let sources = self.sources.lock();
        let mut records = Vec::new();
        for (key, source) in sources.iter() {
            if !predicate(source) {
                continue;
            }
            if let Some(previous) = self.stage.get(key) {
                let current = transform(source);
                records.push(Change::Update { key: key.clone(), current, previous, current_index: None, previous_index: None });
            }
        }
        drop(sources);
        self.publish(records);
    }

    pub fn force_transform_all(&self) {
        self.force_transform_where(|_| true);
    }

    fn publish(&self, records: Vec<Change<K, D>>) {
        for record in &records {
            self.stage.apply(&ChangeSet::single(record.clone()));
        }
        if let Some(change_set) = ChangeSet::from_records(records) {
            self.stage.emit(&change_set);
        }
    }
}

impl<K, V, D> Observer<ChangeSet<K, V>> for Transform<K, V, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let transform = self.transform.lock().clone();
        let mut sources = self.sources.lock();
        let mut records = Vec::new();
        for record in upstream_set.records() {
            let key = record.key().clone();
            match record {
                Change::Add { current, .. } => {
                    sources.insert(key.clone(), current.clone());
                    records.push(Change::Add { key, current: transform(current), current_index: None });
                }
                Change::Update { current, .. } => {
                    sources.insert(key.clone(), current.clone());
                    let previous = self.stage.get(&key).expect("transform mirror holds every live key");
                    records.push(Change::Update { key, current: transform(current), previous, current_index: None, previous_index: None });
                }
                Change::Remove { .. } => {
                    sources.remove(&key);
                    if let Some(previous) = self.stage.get(&key) {
                        records.push(Change::Remove { key, previous, previous_index: None });
                    }
                }
                Change::Refresh { current, .. } | Change::Moved { current, .. } => {
                    sources.insert(key.clone(), current.clone());
                    // §4.3.2: the default transform re-applies the function
                    // and emits Update, not Refresh — Refresh is reserved
                    // for TransformImmutable.
                    let previous = self.stage.get(&key).expect("transform mirror holds every live key");
                    records.push(Change::Update { key, current: transform(current), previous, current_index: None, previous_index: None });
                }
            }
        }
        drop(sources);
        self.publish(records);
    }

    fn on_error(&self, error: &Error) {
        self.stage.on_error(error);
    }

    fn on_completed(&self) {
        self.stage.on_completed();
    }
}

impl<K, V, D> ChangeSetSource<K, D> for Transform<K, V, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, D>>>) -> Subscription<ChangeSet<K, D>> {
        self.stage.connect(observer)
    }
}

/// Keyed transform, immutable variant (§4.3.2): identical to [`Transform`]
/// on Add/Update/Remove, but a Refresh or Moved never re-runs `transform` —
/// the destination is assumed immutable with respect to a source mutation
/// signal, so the already-computed value is forwarded unchanged as a
/// `Refresh`, preserving I4 (identity/value unchanged) instead of spending
/// an Update on a value that didn't change.
pub struct TransformImmutable<K, V, D> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    transform: Mutex<TransformFn<V, D>>,
    sources: Mutex<HashMap<K, V>>,
    stage: MaterializedKeyedStage<K, D>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V, D> TransformImmutable<K, V, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, transform: impl Fn(&V) -> D + Send + Sync + 'static) -> Arc<Self> {
        let this = Arc::new(TransformImmutable {
            upstream,
            transform: Mutex::new(Arc::new(transform)),
            sources: Mutex::new(HashMap::new()),
            stage: MaterializedKeyedStage::new(),
            upstream_subscription: Mutex::new(None),
        });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }
}

impl<K, V, D> Observer<ChangeSet<K, V>> for TransformImmutable<K, V, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let transform = self.transform.lock().clone();
        let mut sources = self.sources.lock();
        let mut records = Vec::new();
        for record in upstream_set.records() {
            let key = record.key().clone();
            match record {
                Change::Add { current, .. } => {
                    sources.insert(key.clone(), current.clone());
                    records.push(Change::Add { key, current: transform(current), current_index: None });
                }
                Change::Update { current, .. } => {
                    sources.insert(key.clone(), current.clone());
                    let previous = self.stage.get(&key).expect("transform mirror holds every live key");
                    records.push(Change::Update { key, current: transform(current), previous, current_index: None, previous_index: None });
                }
                Change::Remove { .. } => {
                    sources.remove(&key);
                    if let Some(previous) = self.stage.get(&key) {
                        records.push(Change::Remove { key, previous, previous_index: None });
                    }
                }
                Change::Refresh { current, .. } | Change::Moved { current, .. } => {
                    sources.insert(key.clone(), current.clone());
                    if let Some(destination) = self.stage.get(&key) {
                        records.push(Change::Refresh { key, current: destination, current_index: None });
                    }
                }
            }
        }
        drop(sources);
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

impl<K, V, D> ChangeSetSource<K, D> for TransformImmutable<K, V, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, D>>>) -> Subscription<ChangeSet<K, D>> {
        self.stage.connect(observer)
    }
}

/// Transform-safe (§4.3.2): a fallible transform. With a handler, a failing
/// item is dropped from the downstream (and logged through the handler)
/// without terminating the stream; without one, the first failure
/// propagates via `on_error`.
pub struct TransformSafe<K, V, D> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    transform: Arc<dyn Fn(&V) -> anyhow::Result<D> + Send + Sync>,
    handler: Option<Arc<dyn Fn(&K, &anyhow::Error) + Send + Sync>>,
    stage: MaterializedKeyedStage<K, D>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V, D> TransformSafe<K, V, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    pub fn new(
        upstream: Arc<dyn ChangeSetSource<K, V>>,
        transform: impl Fn(&V) -> anyhow::Result<D> + Send + Sync + 'static,
        handler: Option<Arc<dyn Fn(&K, &anyhow::Error) + Send + Sync>>,
    ) -> Arc<Self> {
        let this = Arc::new(TransformSafe { upstream, transform: Arc::new(transform), handler, stage: MaterializedKeyedStage::new(), upstream_subscription: Mutex::new(None) });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }
}

impl<K, V, D> Observer<ChangeSet<K, V>> for TransformSafe<K, V, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let mut records = Vec::new();
        for record in upstream_set.records() {
            let key = record.key().clone();
            let result = match record {
                Change::Remove { .. } => {
                    if let Some(previous) = self.stage.get(&key) {
                        Ok(Some(Change::Remove { key: key.clone(), previous, previous_index: None }))
                    } else {
                        Ok(None)
                    }
                }
                _ => {
                    let current = record.current().expect("non-Remove records always carry a current value");
                    match (self.transform)(current) {
                        Ok(destination) => Ok(Some(match self.stage.get(&key) {
                            Some(previous) => Change::Update { key: key.clone(), current: destination, previous, current_index: None, previous_index: None },
                            None => Change::Add { key: key.clone(), current: destination, current_index: None },
                        })),
                        Err(error) => Err(error),
                    }
                }
            };
            match result {
                Ok(Some(downstream)) => records.push(downstream),
                Ok(None) => {}
                Err(error) => match &self.handler {
                    Some(handler) => {
                        tracing::warn!(%error, "transform_safe: item dropped");
                        handler(&key, &error);
                    }
                    None => {
                        for record in &records {
                            self.stage.apply(&ChangeSet::single(record.clone()));
                        }
                        if let Some(change_set) = ChangeSet::from_records(records) {
                            self.stage.emit(&change_set);
                        }
                        self.stage.on_error(&Error::UserFn(error));
                        return;
                    }
                },
            }
        }
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

impl<K, V, D> ChangeSetSource<K, D> for TransformSafe<K, V, D>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, D>>>) -> Subscription<ChangeSet<K, D>> {
        self.stage.connect(observer)
    }
}

/// Transform-many, static child shape (§4.3.2): fans a parent item out to a
/// plain `Vec<C>` via `children_of`, keyed downstream by `(parent key,
/// child key)`. On parent remove, every child produced for that parent is
/// removed.
pub struct TransformMany<K, V, CK, C> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    children_of: Arc<dyn Fn(&V) -> Vec<C> + Send + Sync>,
    child_key: Arc<dyn Fn(&C) -> CK + Send + Sync>,
    parent_children: Mutex<HashMap<K, Vec<CK>>>,
    stage: MaterializedKeyedStage<(K, CK), C>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V, CK, C> TransformMany<K, V, CK, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, children_of: impl Fn(&V) -> Vec<C> + Send + Sync + 'static, child_key: impl Fn(&C) -> CK + Send + Sync + 'static) -> Arc<Self> {
        let this = Arc::new(TransformMany {
            upstream,
            children_of: Arc::new(children_of),
            child_key: Arc::new(child_key),
            parent_children: Mutex::new(HashMap::new()),
            stage: MaterializedKeyedStage::new(),
            upstream_subscription: Mutex::new(None),
        });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    fn remove_parent(&self, parent: &K, records: &mut Vec<Change<(K, CK), C>>) {
        if let Some(child_keys) = self.parent_children.lock().remove(parent) {
            for child_key in child_keys {
                let composite = (parent.clone(), child_key);
                if let Some(previous) = self.stage.get(&composite) {
                    records.push(Change::Remove { key: composite, previous, previous_index: None });
                }
            }
        }
    }

    fn add_parent(&self, parent: &K, value: &V, records: &mut Vec<Change<(K, CK), C>>) {
        let children = (self.children_of)(value);
        let mut child_keys = Vec::with_capacity(children.len());
        for child in children {
            let child_key = (self.child_key)(&child);
            child_keys.push(child_key.clone());
            records.push(Change::Add { key: (parent.clone(), child_key), current: child, current_index: None });
        }
        self.parent_children.lock().insert(parent.clone(), child_keys);
    }
}

impl<K, V, CK, C> Observer<ChangeSet<K, V>> for TransformMany<K, V, CK, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let mut records = Vec::new();
        for record in upstream_set.records() {
            let parent = record.key().clone();
            match record {
                Change::Remove { .. } => self.remove_parent(&parent, &mut records),
                _ => {
                    self.remove_parent(&parent, &mut records);
                    let current = record.current().expect("non-Remove records always carry a current value");
                    self.add_parent(&parent, current, &mut records);
                }
            }
        }
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

impl<K, V, CK, C> ChangeSetSource<(K, CK), C> for TransformMany<K, V, CK, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<(K, CK), C>>>) -> Subscription<ChangeSet<(K, CK), C>> {
        self.stage.connect(observer)
    }
}

struct ChildTap<K, V, CK, C> {
    parent: K,
    owner: Weak<TransformManyDynamic<K, V, CK, C>>,
}

impl<K, V, CK, C> Observer<ChangeSet<CK, C>> for ChildTap<K, V, CK, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    fn on_next(&self, child_set: &ChangeSet<CK, C>) {
        if let Some(owner) = self.owner.upgrade() {
            owner.on_child_next(&self.parent, child_set);
        }
    }

    fn on_error(&self, error: &Error) {
        if let Some(owner) = self.owner.upgrade() {
            owner.stage.on_error(error);
        }
    }

    fn on_completed(&self) {}
}

/// Transform-many, dynamic child shape (§4.3.2, "recommended"): each
/// parent's children are themselves a change-set-producing source (`V ->
/// Arc<dyn ChangeSetSource<CK, C>>`). The operator subscribes to that
/// source while the parent is present, forwarding the child stream's own
/// add/update/remove/refresh as composite-`(parent, child)`-keyed records;
/// on parent remove (or on a parent update that swaps in a different child
/// source), the prior subscription is dropped and every child it had
/// produced is removed.
pub struct TransformManyDynamic<K, V, CK, C> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    children_of: Arc<dyn Fn(&V) -> Arc<dyn ChangeSetSource<CK, C>> + Send + Sync>,
    child_subscriptions: Mutex<HashMap<K, Subscription<ChangeSet<CK, C>>>>,
    parent_children: Mutex<HashMap<K, std::collections::HashSet<CK>>>,
    stage: MaterializedKeyedStage<(K, CK), C>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
    self_weak: Mutex<Weak<TransformManyDynamic<K, V, CK, C>>>,
}

impl<K, V, CK, C> TransformManyDynamic<K, V, CK, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, children_of: impl Fn(&V) -> Arc<dyn ChangeSetSource<CK, C>> + Send + Sync + 'static) -> Arc<Self> {
        let this = Arc::new(TransformManyDynamic {
            upstream,
            children_of: Arc::new(children_of),
            child_subscriptions: Mutex::new(HashMap::new()),
            parent_children: Mutex::new(HashMap::new()),
            stage: MaterializedKeyedStage::new(),
            upstream_subscription: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
        });
        *this.self_weak.lock() = Arc::downgrade(&this);
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    fn detach_parent(&self, parent: &K, records: &mut Vec<Change<(K, CK), C>>) {
        self.child_subscriptions.lock().remove(parent);
        if let Some(children) = self.parent_children.lock().remove(parent) {
            for child_key in children {
                let composite = (parent.clone(), child_key);
                if let Some(previous) = self.stage.get(&composite) {
                    records.push(Change::Remove { key: composite, previous, previous_index: None });
                }
            }
        }
    }

    fn attach_parent(&self, parent: K, value: &V) {
        let Some(strong_self) = self.self_weak.lock().upgrade() else { return };
        let child_source = (self.children_of)(value);
        let tap = Arc::new(ChildTap { parent: parent.clone(), owner: Arc::downgrade(&strong_self) });
        let subscription = child_source.connect(tap);
        self.child_subscriptions.lock().insert(parent, subscription);
    }

    fn on_child_next(&self, parent: &K, child_set: &ChangeSet<CK, C>) {
        let mut records = Vec::new();
        let mut parent_children = self.parent_children.lock();
        let children = parent_children.entry(parent.clone()).or_default();
        for record in child_set.records() {
            let child_key = record.key().clone();
            let composite = (parent.clone(), child_key.clone());
            match record {
                Change::Remove { .. } => {
                    children.remove(&child_key);
                    if let Some(previous) = self.stage.get(&composite) {
                        records.push(Change::Remove { key: composite, previous, previous_index: None });
                    }
                }
                _ => {
                    let current = record.current().expect("non-Remove records always carry a current value").clone();
                    children.insert(child_key);
                    records.push(match self.stage.get(&composite) {
                        Some(previous) => Change::Update { key: composite, current, previous, current_index: None, previous_index: None },
                        None => Change::Add { key: composite, current, current_index: None },
                    });
                }
            }
        }
        drop(parent_children);
        for record in &records {
            self.stage.apply(&ChangeSet::single(record.clone()));
        }
        if let Some(change_set) = ChangeSet::from_records(records) {
            tracing::trace!(total = change_set.total(), "transform_many (dynamic) child batch forwarded");
            self.stage.emit(&change_set);
        }
    }
}

impl<K, V, CK, C> Observer<ChangeSet<K, V>> for TransformManyDynamic<K, V, CK, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let mut records = Vec::new();
        for record in upstream_set.records() {
            let parent = record.key().clone();
            match record {
                Change::Remove { .. } => self.detach_parent(&parent, &mut records),
                Change::Add { current, .. } | Change::Update { current, .. } => {
                    self.detach_parent(&parent, &mut records);
                    self.attach_parent(parent, current);
                }
                // I4: neither carries a new value, so the child source a
                // parent is already wired to is still the right one.
                Change::Refresh { .. } | Change::Moved { .. } => {}
            }
        }
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

impl<K, V, CK, C> ChangeSetSource<(K, CK), C> for TransformManyDynamic<K, V, CK, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<(K, CK), C>>>) -> Subscription<ChangeSet<(K, CK), C>> {
        self.stage.connect(observer)
    }
}

type Unsubscribe = Box<dyn FnOnce() + Send>;
type ChildrenCallback<C> = Arc<dyn Fn(Vec<C>) + Send + Sync>;
type SubscribeChildren<V, C> = Arc<dyn Fn(&V, ChildrenCallback<C>) -> Unsubscribe + Send + Sync>;

/// Transform-many, bridged child shape (§4.3.2): children come from an
/// external notifying collection reached through a capability closure
/// (the same "plain `Fn` closure over a reference" discipline
/// [`crate::operators::property_filter::PropertyFilter`] uses for mutation
/// notification), which hands back the *entire current child list* on
/// every fire rather than an incremental delta. Per spec.md §9's resolved
/// Open Question, a fire is **not** coalesced into one change set: the
/// old children are removed in one emission and the new children added in
/// a second, preserving the external collaborator's own clear-then-add-range
/// boundary instead of merging across it.
pub struct TransformManyBridged<K, V, CK, C> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    child_key: Arc<dyn Fn(&C) -> CK + Send + Sync>,
    subscribe_children: SubscribeChildren<V, C>,
    active: Mutex<HashMap<K, Unsubscribe>>,
    parent_children: Mutex<HashMap<K, Vec<CK>>>,
    stage: MaterializedKeyedStage<(K, CK), C>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
    self_weak: Mutex<Weak<TransformManyBridged<K, V, CK, C>>>,
}

impl<K, V, CK, C> TransformManyBridged<K, V, CK, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    pub fn new(
        upstream: Arc<dyn ChangeSetSource<K, V>>,
        child_key: impl Fn(&C) -> CK + Send + Sync + 'static,
        subscribe_children: impl Fn(&V, ChildrenCallback<C>) -> Unsubscribe + Send + Sync + 'static,
    ) -> Arc<Self> {
        let this = Arc::new(TransformManyBridged {
            upstream,
            child_key: Arc::new(child_key),
            subscribe_children: Arc::new(subscribe_children),
            active: Mutex::new(HashMap::new()),
            parent_children: Mutex::new(HashMap::new()),
            stage: MaterializedKeyedStage::new(),
            upstream_subscription: Mutex::new(None),
            self_weak: Mutex::new(Weak::new()),
        });
        *this.self_weak.lock() = Arc::downgrade(&this);
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    fn detach_parent(&self, parent: &K) {
        if let Some(unsubscribe) = self.active.lock().remove(parent) {
            unsubscribe();
        }
        if let Some(children) = self.parent_children.lock().remove(parent) {
            let records: Vec<_> = children
                .into_iter()
                .filter_map(|child_key| {
                    let composite = (parent.clone(), child_key);
                    self.stage.get(&composite).map(|previous| Change::Remove { key: composite, previous, previous_index: None })
                })
                .collect();
            self.publish(records);
        }
    }

    fn attach_parent(&self, parent: K, value: &V) {
        let Some(strong_self) = self.self_weak.lock().upgrade() else { return };
        let callback_parent = parent.clone();
        let callback: ChildrenCallback<C> = Arc::new(move |children| strong_self.on_children_fired(&callback_parent, children));
        let unsubscribe = (self.subscribe_children)(value, callback);
        if let Some(stale) = self.active.lock().insert(parent, unsubscribe) {
            stale();
        }
    }

    fn on_children_fired(&self, parent: &K, children: Vec<C>) {
        // "Clear": remove every child this parent previously produced, as
        // its own emission.
        let old = self.parent_children.lock().remove(parent).unwrap_or_default();
        let clear_records: Vec<_> = old
            .into_iter()
            .filter_map(|child_key| {
                let composite = (parent.clone(), child_key);
                self.stage.get(&composite).map(|previous| Change::Remove { key: composite, previous, previous_index: None })
            })
            .collect();
        self.publish(clear_records);

        // "Add-range": add the freshly-fired children, as a second, separate
        // emission.
        let mut new_keys = Vec::with_capacity(children.len());
        let add_records: Vec<_> = children
            .into_iter()
            .map(|child| {
                let child_key = (self.child_key)(&child);
                new_keys.push(child_key.clone());
                Change::Add { key: (parent.clone(), child_key), current: child, current_index: None }
            })
            .collect();
        self.parent_children.lock().insert(parent.clone(), new_keys);
        self.publish(add_records);
    }

    fn publish(&self, records: Vec<Change<(K, CK), C>>) {
        for record in &records {
            self.stage.apply(&ChangeSet::single(record.clone()));
        }
        if let Some(change_set) = ChangeSet::from_records(records) {
            tracing::trace!(total = change_set.total(), "transform_many (bridged) emitted");
            self.stage.emit(&change_set);
        }
    }
}

impl<K, V, CK, C> Observer<ChangeSet<K, V>> for TransformManyBridged<K, V, CK, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        for record in upstream_set.records() {
            let parent = record.key().clone();
            match record {
                Change::Remove { .. } => self.detach_parent(&parent),
                Change::Add { current, .. } | Change::Update { current, .. } => {
                    self.detach_parent(&parent);
                    self.attach_parent(parent, current);
                }
                Change::Refresh { .. } | Change::Moved { .. } => {}
            }
        }
    }

    fn on_error(&self, error: &Error) {
        self.stage.on_error(error);
    }

    fn on_completed(&self) {
        self.stage.on_completed();
    }
}

impl<K, V, CK, C> ChangeSetSource<(K, CK), C> for TransformManyBridged<K, V, CK, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    CK: Eq + Hash + Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<(K, CK), C>>>) -> Subscription<ChangeSet<(K, CK), C>> {
        self.stage.connect(observer)
    }
}

impl<K, V, CK, C> Drop for TransformManyBridged<K, V, CK, C> {
    fn drop(&mut self) {
        for (_, unsubscribe) in self.active.get_mut().drain() {
            unsubscribe();
        }
    }
}

/// A node produced by [`TransformToTree`]: the item plus the keys of its
/// direct children at the moment this node was last (re)emitted.
#[derive(Clone, Debug)]
pub struct TreeNode<K, V> {
    pub item: V,
    pub children: Vec<K>,
}

/// Transform-to-tree (§4.3.2): pivots a flat keyed collection into a
/// hierarchy via a `parent_key` selector. Each node carries its direct
/// children's keys; a consumer looks those up against the same downstream
/// cache to walk further down, matching the "children are themselves
/// change-set streams" note without requiring a second stream type.
pub struct TransformToTree<K, V> {
    upstream: Arc<dyn ChangeSetSource<K, V>>,
    parent_key: Arc<dyn Fn(&V) -> Option<K> + Send + Sync>,
    items: Mutex<HashMap<K, V>>,
    children_of: Mutex<HashMap<Option<K>, Vec<K>>>,
    stage: MaterializedKeyedStage<K, TreeNode<K, V>>,
    upstream_subscription: Mutex<Option<Subscription<ChangeSet<K, V>>>>,
}

impl<K, V> TransformToTree<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(upstream: Arc<dyn ChangeSetSource<K, V>>, parent_key: impl Fn(&V) -> Option<K> + Send + Sync + 'static) -> Arc<Self> {
        let this = Arc::new(TransformToTree {
            upstream,
            parent_key: Arc::new(parent_key),
            items: Mutex::new(HashMap::new()),
            children_of: Mutex::new(HashMap::new()),
            stage: MaterializedKeyedStage::new(),
            upstream_subscription: Mutex::new(None),
        });
        let subscription = this.upstream.connect(this.clone());
        *this.upstream_subscription.lock() = Some(subscription);
        this
    }

    fn node_for(&self, key: &K, items: &HashMap<K, V>, children_of: &HashMap<Option<K>, Vec<K>>) -> TreeNode<K, V> {
        TreeNode { item: items.get(key).cloned().expect("node requested for a live key"), children: children_of.get(&Some(key.clone())).cloned().unwrap_or_default() }
    }

    fn touch(&self, key: &K, items: &HashMap<K, V>, children_of: &HashMap<Option<K>, Vec<K>>, records: &mut Vec<Change<K, TreeNode<K, V>>>) {
        if !items.contains_key(key) {
            return;
        }
        let current = self.node_for(key, items, children_of);
        match self.stage.get(key) {
            Some(previous) => records.push(Change::Update { key: key.clone(), current, previous, current_index: None, previous_index: None }),
            None => records.push(Change::Add { key: key.clone(), current, current_index: None }),
        }
    }
}

impl<K, V> Observer<ChangeSet<K, V>> for TransformToTree<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn on_next(&self, upstream_set: &ChangeSet<K, V>) {
        let mut items = self.items.lock();
        let mut children_of = self.children_of.lock();
        let mut touched_parents = Vec::new();
        let mut records = Vec::new();

        for record in upstream_set.records() {
            let key = record.key().clone();
            let previous_parent = items.get(&key).map(|v| (self.parent_key)(v));
            match record {
                Change::Remove { .. } => {
                    items.remove(&key);
                    if let Some(previous_parent) = previous_parent {
                        if let Some(siblings) = children_of.get_mut(&previous_parent) {
                            siblings.retain(|child| child != &key);
                        }
                        touched_parents.push(previous_parent);
                    }
                    if let Some(previous) = self.stage.get(&key) {
                        records.push(Change::Remove { key, previous, previous_index: None });
                    }
                }
                _ => {
                    let current = record.current().expect("non-Remove records always carry a current value").clone();
                    let new_parent = (self.parent_key)(&current);
                    items.insert(key.clone(), current);
                    if previous_parent.as_ref() != Some(&new_parent) {
                        if let Some(previous_parent) = previous_parent {
                            if let Some(siblings) = children_of.get_mut(&previous_parent) {
                                siblings.retain(|child| child != &key);
                            }
                            touched_parents.push(previous_parent);
                        }
                        children_of.entry(new_parent.clone()).or_default().push(key.clone());
                        touched_parents.push(new_parent);
                    }
                    touched_parents.push(Some(key.clone()));
                }
            }
        }

        for key in touched_parents.into_iter().flatten() {
            self.touch(&key, &items, &children_of, &mut records);
        }

        drop(items);
        drop(children_of);
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

impl<K, V> ChangeSetSource<K, TreeNode<K, V>> for TransformToTree<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, TreeNode<K, V>>>>) -> Subscription<ChangeSet<K, TreeNode<K, V>>> {
        self.stage.connect(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::test_support::RecordingObserver;

    #[test]
    fn projects_and_updates() {
        let source = SourceCache::new(|v: &i32| *v);
        source.add_or_update(1);
        let doubled = Transform::new(source.clone(), |v: &i32| v * 2);
        let recorder = RecordingObserver::new();
        let _sub = doubled.connect(recorder.as_observer());
        assert_eq!(recorder.items()[0].adds(), 1);
        source.refresh(&1);
        // §4.3.2: the default transform re-applies the function and emits
        // Update on a Refresh, not Refresh itself.
        assert_eq!(recorder.items()[1].updates(), 1);
        assert_eq!(doubled.stage.get(&1), Some(2));
    }

    #[test]
    fn immutable_variant_forwards_refresh_without_recomputing() {
        let source = SourceCache::new(|v: &i32| *v);
        source.add_or_update(1);
        let doubled = TransformImmutable::new(source.clone(), |v: &i32| v * 2);
        let recorder = RecordingObserver::new();
        let _sub = doubled.connect(recorder.as_observer());
        assert_eq!(recorder.items()[0].adds(), 1);
        source.refresh(&1);
        assert_eq!(recorder.items()[1].refreshes(), 1);
        assert_eq!(recorder.items()[1].updates(), 0);
        assert_eq!(doubled.stage.get(&1), Some(2));
    }

    #[test]
    fn transform_many_dynamic_tracks_child_source_lifecycle() {
        let parents = SourceCache::new(|v: &i32| *v);
        parents.add_or_update(1);
        let child_sources: Arc<Mutex<HashMap<i32, Arc<SourceCache<i32, &'static str>>>>> = Arc::new(Mutex::new(HashMap::new()));
        let child_sources_for_closure = child_sources.clone();
        let many = TransformManyDynamic::new(parents.clone(), move |parent: &i32| {
            let children = SourceCache::new(|s: &&'static str| s.len() as i32);
            children.add_or_update("a");
            child_sources_for_closure.lock().insert(*parent, children.clone());
            children as Arc<dyn ChangeSetSource<i32, &'static str>>
        });
        let recorder = RecordingObserver::new();
        let _sub = many.connect(recorder.as_observer());
        assert!(many.stage.contains(&(1, 1)));

        child_sources.lock().get(&1).unwrap().add_or_update("bb");
        assert!(many.stage.contains(&(1, 2)));

        parents.remove(&1);
        assert!(!many.stage.contains(&(1, 1)));
        assert!(!many.stage.contains(&(1, 2)));
    }

    #[test]
    fn transform_many_bridged_replaces_children_as_two_emissions() {
        let parents = SourceCache::new(|v: &i32| *v);
        parents.add_or_update(1);
        let fire: Arc<Mutex<Option<ChildrenCallback<&'static str>>>> = Arc::new(Mutex::new(None));
        let fire_for_closure = fire.clone();
        let many = TransformManyBridged::new(
            parents.clone(),
            |s: &&'static str| s.len() as i32,
            move |_value: &i32, callback| {
                *fire_for_closure.lock() = Some(callback);
                Box::new(|| {})
            },
        );
        let recorder = RecordingObserver::new();
        let _sub = many.connect(recorder.as_observer());

        let callback = fire.lock().clone().unwrap();
        callback(vec!["a", "bb"]);
        assert!(many.stage.contains(&(1, 1)));
        assert!(many.stage.contains(&(1, 2)));

        callback(vec!["ccc"]);
        assert!(!many.stage.contains(&(1, 1)));
        assert!(!many.stage.contains(&(1, 2)));
        assert!(many.stage.contains(&(1, 3)));

        let batches = recorder.items();
        let last_two = &batches[batches.len() - 2..];
        assert_eq!(last_two[0].removes(), 2);
        assert_eq!(last_two[1].adds(), 1);
    }
}
