//! Minimal synchronous, push-based observable primitives.
//!
//! Spec.md treats the reactive runtime (subscribe/on_next/on_error/
//! on_completed, disposal, publish/connect, synchronize) as an external
//! collaborator. No Rx-style synchronous push runtime is part of the Rust
//! ecosystem the way ReactiveX is for .NET/Java, so this module provides the
//! small slice the core actually needs, generalising
//! `artifice::util::messaging::{MessageBus, TopicListeners}` (a weak-
//! reference listener registry) and `veda::db::Database::update` (a
//! single-writer mutation that walks its watcher list synchronously) to be
//! `Send + Sync` via `parking_lot`, per §5's per-source lock discipline.

mod subject;

pub use subject::{Observer, Subject, Subscription};
