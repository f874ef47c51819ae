//! The operator kernel (C5, §4.3): stateful transducers over change-set
//! streams, one module per family as spec.md's §4.3.x subsections lay them
//! out.

pub mod batch;
pub mod bounded;
pub mod combinators;
pub mod dispose;
pub mod distinct;
pub mod filter;
pub mod group;
pub mod join;
pub mod page;
pub mod property_filter;
pub mod sort;
pub mod transform;

pub use batch::{Batch, DeferUntilLoaded, NotEmpty, SkipInitial};
pub use bounded::{ExpireAfter, LimitSizeTo};
pub use combinators::{Combinator, CombinatorOp};
pub use dispose::DisposeMany;
pub use distinct::Distinct;
pub use filter::{DynamicFilter, Filter, ListFilterPolicy};
pub use group::{Group, GroupBucket};
pub use join::{Join, JoinKey};
pub use page::{Page, Window};
pub use property_filter::PropertyFilter;
pub use sort::{Sort, ALWAYS_RESET, NEVER_RESET};
pub use transform::{Transform, TransformImmutable, TransformMany, TransformManyBridged, TransformManyDynamic, TransformSafe, TransformToTree, TreeNode};
