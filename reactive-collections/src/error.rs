//! Crate-wide error types.
//!
//! Every module that can fail defines its own `thiserror` enum scoped to that
//! module's concerns; this module unifies them behind a single [`Error`] so
//! the public facade can expose one `Result` alias. Mirrors the layering in
//! `artifice::model::error` / `artifice::eval::error`.

use thiserror::Error;

/// Errors surfaced while editing or reading a source collection.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("duplicate key produced by key selector")]
    DuplicateKey,
    #[error("key not present in cache")]
    KeyNotFound,
}

/// Errors surfaced by list-indexed sources.
#[derive(Debug, Error)]
pub enum ListError {
    #[error("index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
}

/// Errors surfaced while applying a sorted/keyed change set to a binding
/// target (§4.4).
#[derive(Debug, Error)]
pub enum BindError {
    #[error("binding target rejected operation: {0}")]
    Target(String),
}

/// A contract violation by an upstream publisher (§7 kind 3): an empty
/// change set, or a mismatched previous/current pair on `Update`. Operators
/// assert on this in debug builds and best-effort normalise in release.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("upstream published an empty change set")]
    EmptyChangeSet,
    #[error("update record for key is missing its previous value")]
    MissingPrevious,
}

/// Top-level error type returned by the public facade.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    List(#[from] ListError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    /// A user-supplied predicate/selector/comparer/transform failed.
    /// Default propagation path for §7 kind 1; `transform_safe` intercepts
    /// this locally instead of letting it reach `on_error`.
    #[error("user function failed")]
    UserFn(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
