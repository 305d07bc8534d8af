//! Query pipeline
//!
//! A query runs as a chain of pull-based stages over the cross-partition
//! source, or over the ORDER BY merge of sorted per-range streams. Each
//! stage owns its inner stage and nests the inner stage's continuation
//! state inside its own token.
//!
//! ```ignore
//! use crossfeed::query::{QueryIterator, QueryPlan};
//!
//! let plan = QueryPlan::passthrough().with_top(10);
//! let mut query = QueryIterator::new(fetcher, FeedRange::Full, &plan, None, &config, metrics)?;
//! while let Some(page) = query.next_page(&cancellation).await {
//!     let page = page?;
//!     // page.documents, page.continuation
//! }
//! ```

pub mod distinct;
pub mod group_by;
pub mod hash;
pub mod iterator;
pub mod order_by;
pub mod plan;
pub mod skip;
pub mod source;
pub mod stage;
pub mod take;

#[cfg(test)]
pub(crate) mod testing;

pub use distinct::{DistinctMap, DistinctStage, DistinctType};
pub use group_by::{
    AggregateKind, AggregatorLayout, ClientGroupByStage, ComputeGroupByStage, GroupingTable,
};
pub use hash::{structural_hash, tuple_hash};
pub use iterator::{QueryIterator, QueryResponse};
pub use order_by::{OrderByStage, SortOrder};
pub use plan::{create_pipeline, GroupByPlan, QueryPlan};
pub use skip::SkipStage;
pub use source::SourceStage;
pub use stage::{BoxedStage, CreateStage, EmptyStage, PipelineStage, QueryPage};
pub use take::{TakeKind, TakeStage};
