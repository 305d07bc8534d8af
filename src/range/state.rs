//! Per-range read progress

use serde_json::Value;

use super::feed_range::FeedRange;
use crate::errors::{PipelineError, PipelineResult};

/// How far consumption of one range has progressed
#[derive(Debug, Clone, PartialEq)]
pub enum ReadState {
    /// Nothing read yet
    Beginning,
    /// Resume after this source-provided cursor
    Continuation(Value),
}

impl ReadState {
    pub fn continuation(token: impl Into<Value>) -> Self {
        ReadState::Continuation(token.into())
    }

    pub fn is_beginning(&self) -> bool {
        matches!(self, ReadState::Beginning)
    }
}

/// A range paired with its progress
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRangeState {
    pub range: FeedRange,
    pub state: ReadState,
}

impl FeedRangeState {
    pub fn new(range: FeedRange, state: ReadState) -> Self {
        Self { range, state }
    }

    pub fn beginning(range: FeedRange) -> Self {
        Self::new(range, ReadState::Beginning)
    }

    /// Split the range in two; both halves resume from the same point
    pub fn split(&self) -> PipelineResult<(FeedRangeState, FeedRangeState)> {
        let (left, right) = self.range.split()?;
        Ok((
            FeedRangeState::new(left, self.state.clone()),
            FeedRangeState::new(right, self.state.clone()),
        ))
    }

    /// Merge two adjacent siblings.
    ///
    /// `None` marks a sibling that is already exhausted. Returns `None` when
    /// both are exhausted.
    pub fn merge(
        left: (&FeedRange, Option<&ReadState>),
        right: (&FeedRange, Option<&ReadState>),
    ) -> PipelineResult<Option<FeedRangeState>> {
        let range = left.0.merge(right.0)?;
        Ok(merged_read_state(left.1, right.1)?.map(|state| FeedRangeState::new(range, state)))
    }
}

/// Pick the authoritative state for two merged siblings.
///
/// An exhausted sibling defers to the active one. Between two active
/// siblings the less progressed wins; `Beginning` is behind any cursor.
/// Two different cursors cannot be ordered because they are opaque, so
/// that case is rejected.
pub fn merged_read_state(
    left: Option<&ReadState>,
    right: Option<&ReadState>,
) -> PipelineResult<Option<ReadState>> {
    match (left, right) {
        (None, None) => Ok(None),
        (Some(state), None) | (None, Some(state)) => Ok(Some(state.clone())),
        (Some(ReadState::Beginning), Some(_)) | (Some(_), Some(ReadState::Beginning)) => {
            Ok(Some(ReadState::Beginning))
        }
        (Some(a), Some(b)) if a == b => Ok(Some(a.clone())),
        (Some(_), Some(_)) => Err(PipelineError::InvalidArgument(
            "cannot order two different continuations of merged siblings".to_string(),
        )),
    }
}

/// Ordered, non-empty, disjoint set of range states.
///
/// This is what a read-feed continuation token carries.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossFeedRangeState {
    entries: Vec<FeedRangeState>,
}

impl CrossFeedRangeState {
    pub fn new(entries: Vec<FeedRangeState>) -> PipelineResult<Self> {
        if entries.is_empty() {
            return Err(PipelineError::InvalidArgument(
                "cross feed range state must not be empty".to_string(),
            ));
        }
        for (i, a) in entries.iter().enumerate() {
            for b in &entries[i + 1..] {
                if a.range.overlaps(&b.range) {
                    return Err(PipelineError::InvalidArgument(format!(
                        "ranges {} and {} overlap",
                        a.range, b.range
                    )));
                }
            }
        }
        Ok(Self { entries })
    }

    /// Caller guarantees a non-empty, disjoint list
    pub(crate) fn from_disjoint(entries: Vec<FeedRangeState>) -> Option<Self> {
        if entries.is_empty() {
            None
        } else {
            Some(Self { entries })
        }
    }

    /// Whole key space from the beginning
    pub fn full_beginning() -> Self {
        Self {
            entries: vec![FeedRangeState::beginning(FeedRange::Full)],
        }
    }

    pub fn single(range: FeedRange, state: ReadState) -> Self {
        Self {
            entries: vec![FeedRangeState::new(range, state)],
        }
    }

    pub fn entries(&self) -> &[FeedRangeState] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FeedRangeState> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<FeedRangeState> {
        self.entries
    }

    /// Split into two halves for two independent consumers.
    ///
    /// Several entries are divided by position; a single entry is split
    /// by key range. Returns `None` if neither is possible.
    pub fn try_split(&self) -> Option<(CrossFeedRangeState, CrossFeedRangeState)> {
        if self.entries.len() > 1 {
            let mid = self.entries.len() / 2;
            return Some((
                Self {
                    entries: self.entries[..mid].to_vec(),
                },
                Self {
                    entries: self.entries[mid..].to_vec(),
                },
            ));
        }
        let (left, right) = self.entries[0].split().ok()?;
        Some((
            Self {
                entries: vec![left],
            },
            Self {
                entries: vec![right],
            },
        ))
    }
}

impl<'a> IntoIterator for &'a CrossFeedRangeState {
    type Item = &'a FeedRangeState;
    type IntoIter = std::slice::Iter<'a, FeedRangeState>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
