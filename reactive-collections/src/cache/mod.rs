//! Keyed collections: C2 (the change-aware mirror every keyed stage
//! embeds) and C3 (the single-writer source cache). See spec §4.1.

pub(crate) mod change_aware;
mod editor;
pub(crate) mod materialized;
mod source;

pub use editor::CacheEditor;
pub use source::SourceCache;
