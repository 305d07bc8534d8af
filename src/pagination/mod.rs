//! Pagination over feed ranges
//!
//! The transport is consumed through [`FeedRangeFetcher`]. The
//! [`CrossPartitionEnumerator`] turns many per-range cursors into one page
//! stream, reconciling splits and merges as it goes.

mod cancellation;
mod enumerator;
mod fetcher;
mod page;
mod read_feed;
pub(crate) mod topology;

pub use cancellation::Cancellation;
pub use enumerator::CrossPartitionEnumerator;
pub use fetcher::{FeedRangeFetcher, FetchFuture};
pub use page::{CrossPartitionPage, Page};
pub use read_feed::{ReadFeedIterator, ReadFeedPage};
