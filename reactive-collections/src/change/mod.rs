//! The change-set data model (C1): typed delta records, change reasons, and
//! change-set summaries. See spec §3.

mod reason;
mod record;
mod set;

pub use reason::{ChangeReason, ListChangeReason, SortReason};
pub use record::{Change, ListChange};
pub use set::{ChangeSet, ListChangeSet, SortedChangeSet};
