//! The seam every stage — source or operator — is built against: "publish a
//! change-set stream, replaying the current state to new subscribers"
//! (§4.3's "stateful transducer with initial materialisation", §6's
//! "Public entry points"). Concrete operators are plain structs
//! implementing one of these two traits rather than an open inheritance
//! hierarchy (§9, "Dynamic dispatch").

use crate::change::{ChangeSet, ListChangeSet, SortedChangeSet};
use crate::reactive::{Observer, Subscription};
use std::sync::Arc;

/// A live source of keyed change sets: a source cache, or any operator
/// downstream of one.
pub trait ChangeSetSource<K, V>: Send + Sync {
    /// Subscribes `observer`. Delivers the current materialised state as a
    /// single initial batch before returning (I2), then streams further
    /// deltas until the returned [`Subscription`] is dropped or disposed.
    fn connect(&self, observer: Arc<dyn Observer<ChangeSet<K, V>>>) -> Subscription<ChangeSet<K, V>>;
}

/// A live source of indexed (list) change sets: a source list, or any
/// operator downstream of one.
pub trait ListChangeSetSource<T>: Send + Sync {
    fn connect(&self, observer: Arc<dyn Observer<ListChangeSet<T>>>) -> Subscription<ListChangeSet<T>>;
}

/// A live source of sorted change sets (§3, "Sorted change set"): emitted
/// only by [`crate::operators::sort::Sort`] and consumed by paging/
/// virtualising operators and the binding adapter (§4.4).
pub trait SortedChangeSetSource<K, V>: Send + Sync {
    fn connect(&self, observer: Arc<dyn Observer<SortedChangeSet<K, V>>>) -> Subscription<SortedChangeSet<K, V>>;
}
