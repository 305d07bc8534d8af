//! Feed range and read state primitives
//!
//! A [`FeedRange`] names a contiguous slice of the key space; a
//! [`ReadState`] records how far reading it has progressed. Together they
//! form the [`CrossFeedRangeState`] that continuation tokens carry.

mod epk;
mod feed_range;
mod state;

pub use epk::{format_epk, parse_epk, partition_key_epk, MAX_EPK, MIN_EPK};
pub use feed_range::{EpkRange, FeedRange};
pub use state::{merged_read_state, CrossFeedRangeState, FeedRangeState, ReadState};
