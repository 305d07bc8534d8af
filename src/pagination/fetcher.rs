//! Fetch collaborator contract
//!
//! The transport layer (with its retry policy already applied) is consumed
//! only through [`FeedRangeFetcher`].

use std::future::Future;
use std::pin::Pin;

use super::cancellation::Cancellation;
use super::page::Page;
use crate::errors::PipelineResult;
use crate::range::{FeedRange, FeedRangeState};

/// Boxed future returned by fetch collaborators
pub type FetchFuture<'a, T> = Pin<Box<dyn Future<Output = PipelineResult<T>> + Send + 'a>>;

/// Issues physical reads against one feed range
pub trait FeedRangeFetcher: Send + Sync {
    /// Read one page of `range_state.range` starting at `range_state.state`.
    ///
    /// Returns `Err(SplitOrMergeInProgress)` when the range no longer maps
    /// onto exactly one server partition. Any other error is terminal for
    /// this pull and is propagated unchanged.
    fn fetch_page<'a>(
        &'a self,
        range_state: &'a FeedRangeState,
        page_size_hint: usize,
        cancellation: &'a Cancellation,
    ) -> FetchFuture<'a, Page>;

    /// Ranges of the partitions that currently cover `range`, in key order
    fn child_ranges<'a>(
        &'a self,
        range: &'a FeedRange,
        cancellation: &'a Cancellation,
    ) -> FetchFuture<'a, Vec<FeedRange>>;
}
