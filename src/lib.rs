//! crossfeed - cross-partition query and read-feed pipeline
//!
//! Drains paged results from many independently progressing feed ranges
//! and recombines them into one stream with one resumable continuation
//! token. Partition splits and merges are reconciled transparently.
//!
//! Modules, leaves first:
//! - [`range`]: feed ranges and per-range read state
//! - [`pagination`]: fetch contract, cross-partition enumerator, read feed
//! - [`continuation`]: token codec with legacy shape support
//! - [`query`]: TOP/LIMIT, OFFSET, DISTINCT and GROUP BY stages
//!
//! The transport is not part of this crate; callers implement
//! [`pagination::FeedRangeFetcher`].

pub mod config;
pub mod continuation;
pub mod errors;
pub mod observability;
pub mod pagination;
pub mod query;
pub mod range;

pub use config::{ExecutionEnvironment, PipelineConfig};
pub use continuation::{ContinuationCodec, TokenShape};
pub use errors::{ErrorCode, PipelineError, PipelineResult};
pub use pagination::{
    Cancellation, CrossPartitionEnumerator, CrossPartitionPage, FeedRangeFetcher, FetchFuture,
    Page, ReadFeedIterator, ReadFeedPage,
};
pub use query::{QueryIterator, QueryPlan, QueryResponse};
pub use range::{CrossFeedRangeState, EpkRange, FeedRange, FeedRangeState, ReadState};
