//! C8 — the test aggregator: collects every message delivered to an
//! [`Observer`] plus a running summary, for property-style assertions
//! against P1–P8 (§8). Not part of the public operator algebra; used by
//! this crate's own tests and exported for downstream crates' tests.

use crate::change::ChangeSet;
use crate::error::Error;
use crate::reactive::Observer;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static TRACING_INIT: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_test_writer().try_init();
});

/// Installs a test-scoped `tracing` subscriber exactly once per process,
/// matching `artifice/tests/props.rs`'s harness initialisation. Safe to
/// call from every test; later calls are no-ops.
pub fn init_tracing() {
    Lazy::force(&TRACING_INIT);
}

/// Records every `on_next`/`on_error`/`on_completed` call it receives, in
/// order, for later inspection by a test.
pub struct RecordingObserver<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    items: Mutex<Vec<T>>,
    errors: Mutex<Vec<String>>,
    completed: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> Observer<T> for Inner<T> {
    fn on_next(&self, item: &T) {
        self.items.lock().push(item.clone());
    }

    fn on_error(&self, error: &Error) {
        self.errors.lock().push(error.to_string());
    }

    fn on_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }
}

impl<T: Clone + Send + Sync + 'static> Default for RecordingObserver<T> {
    fn default() -> Self {
        RecordingObserver { inner: Arc::new(Inner { items: Mutex::new(Vec::new()), errors: Mutex::new(Vec::new()), completed: AtomicBool::new(false) }) }
    }
}

impl<T: Clone + Send + Sync + 'static> RecordingObserver<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_observer(&self) -> Arc<dyn Observer<T>> {
        self.inner.clone()
    }

    pub fn items(&self) -> Vec<T> {
        self.inner.items.lock().clone()
    }

    pub fn error_count(&self) -> usize {
        self.inner.errors.lock().len()
    }

    pub fn completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }
}

/// Running totals across every change set an aggregator has observed —
/// the "summary" half of C8.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChangeSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
    pub refreshes: usize,
    pub moves: usize,
    pub total: usize,
}

/// Collects every change set delivered to it plus a running [`ChangeSummary`].
pub struct ChangeSetAggregator<K, V> {
    recorder: RecordingObserver<ChangeSet<K, V>>,
}

impl<K, V> Default for ChangeSetAggregator<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        ChangeSetAggregator { recorder: RecordingObserver::default() }
    }
}

impl<K, V> ChangeSetAggregator<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_observer(&self) -> Arc<dyn Observer<ChangeSet<K, V>>> {
        self.recorder.as_observer()
    }

    pub fn messages(&self) -> Vec<ChangeSet<K, V>> {
        self.recorder.items()
    }

    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for message in self.recorder.items() {
            summary.adds += message.adds();
            summary.updates += message.updates();
            summary.removes += message.removes();
            summary.refreshes += message.refreshes();
            summary.moves += message.moves();
            summary.total += message.total();
        }
        summary
    }

    pub fn error_count(&self) -> usize {
        self.recorder.error_count()
    }

    pub fn completed(&self) -> bool {
        self.recorder.completed()
    }
}
