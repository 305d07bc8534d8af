//! Observable pipeline events
//!
//! Events are explicit and typed; the logger only ever sees their
//! `UPPER_SNAKE` names.

use std::fmt;

use super::logger::Severity;

/// Observable events in the query/read-feed pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    // Enumerator lifecycle
    /// Enumerator created from a fresh or resumed state
    EnumeratorStart,
    /// Active set became empty
    EnumeratorDone,
    /// One physical page was fetched
    PageFetched,
    /// A range reported no more pages
    RangeExhausted,

    // Topology
    /// Fetch reported that the range no longer maps to one partition
    TopologyChanged,
    /// Range replaced by its split descendants
    SplitDetected,
    /// Range now served by a merged partition
    MergeDetected,
    /// Logical partition key now served by another partition
    PartitionKeyRelocated,
    /// Sibling entries folded into one range
    RangesCoalesced,
    /// Too many consecutive topology signals for one range
    TopologyRetriesExhausted,

    // Failures
    /// Fetch collaborator returned a terminal or retriable error
    FetchFailed,
    /// Pull aborted by the caller
    PullCancelled,

    // Continuation tokens
    /// Token failed to parse or contradicted the query
    ContinuationRejected,
    /// Legacy token shape rewritten into the array shape
    LegacyTokenNormalized,

    // Query stages
    /// Stage chain assembled from a query plan
    QueryPipelineCreated,
    /// GROUP BY absorbed its last source row
    GroupingTableSealed,
    /// GROUP BY emitted its last bucket
    GroupingTableDrained,
    /// ORDER BY resumed ranges dropped rows already returned
    OrderByRowsSkipped,
}

impl Event {
    /// Returns the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::EnumeratorStart => "ENUMERATOR_START",
            Event::EnumeratorDone => "ENUMERATOR_DONE",
            Event::PageFetched => "PAGE_FETCHED",
            Event::RangeExhausted => "RANGE_EXHAUSTED",
            Event::TopologyChanged => "TOPOLOGY_CHANGED",
            Event::SplitDetected => "SPLIT_DETECTED",
            Event::MergeDetected => "MERGE_DETECTED",
            Event::PartitionKeyRelocated => "PARTITION_KEY_RELOCATED",
            Event::RangesCoalesced => "RANGES_COALESCED",
            Event::TopologyRetriesExhausted => "TOPOLOGY_RETRIES_EXHAUSTED",
            Event::FetchFailed => "FETCH_FAILED",
            Event::PullCancelled => "PULL_CANCELLED",
            Event::ContinuationRejected => "CONTINUATION_REJECTED",
            Event::LegacyTokenNormalized => "LEGACY_TOKEN_NORMALIZED",
            Event::QueryPipelineCreated => "QUERY_PIPELINE_CREATED",
            Event::GroupingTableSealed => "GROUPING_TABLE_SEALED",
            Event::GroupingTableDrained => "GROUPING_TABLE_DRAINED",
            Event::OrderByRowsSkipped => "ORDER_BY_ROWS_SKIPPED",
        }
    }

    /// Default severity for this event
    pub fn severity(&self) -> Severity {
        match self {
            Event::PageFetched | Event::RangeExhausted => Severity::Trace,
            Event::TopologyRetriesExhausted | Event::FetchFailed => Severity::Error,
            Event::ContinuationRejected => Severity::Warn,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
