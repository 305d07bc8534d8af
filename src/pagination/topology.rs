//! Partition map lookups after a split/merge signal

use super::cancellation::Cancellation;
use super::fetcher::FeedRangeFetcher;
use crate::errors::{PipelineError, PipelineResult, STATUS_GONE};
use crate::range::FeedRange;

/// What now serves a range that stopped mapping onto one partition
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Topology {
    /// Several partitions; the children are clipped to the range, in key order
    Split(Vec<FeedRange>),
    /// One partition that covers the range and more
    Merged(FeedRange),
    /// A logical partition key that now lives in this partition
    Relocated(FeedRange),
}

/// Ask the fetcher which partitions cover `range` now.
///
/// The lookup is raced against `cancellation`; nothing is changed on error.
pub(crate) async fn resolve(
    fetcher: &dyn FeedRangeFetcher,
    range: &FeedRange,
    cancellation: &Cancellation,
) -> PipelineResult<Topology> {
    let children = tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(PipelineError::Cancelled),
        result = fetcher.child_ranges(range, cancellation) => result,
    }?;

    let mut overlapping: Vec<FeedRange> = children
        .iter()
        .filter_map(|child| child.intersect(range))
        .collect();
    overlapping.sort_by_key(|child| child.bounds().0);

    if overlapping.is_empty() {
        return Err(PipelineError::fetch_failed(
            STATUS_GONE,
            format!("no partition covers range {}", range),
        ));
    }
    if overlapping.len() > 1 {
        return Ok(Topology::Split(overlapping));
    }

    let parent = children
        .into_iter()
        .find(|child| child.contains(range))
        .ok_or_else(|| {
            PipelineError::fetch_failed(
                STATUS_GONE,
                format!("partition map only partially covers range {}", range),
            )
        })?;
    if range.is_partition_key() {
        Ok(Topology::Relocated(parent))
    } else {
        Ok(Topology::Merged(parent))
    }
}
