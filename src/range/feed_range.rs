//! Feed ranges: contiguous slices of the partitioned key space

use std::fmt;

use serde_json::Value;

use super::epk::{format_epk, parse_epk, partition_key_epk, MAX_EPK, MIN_EPK};
use crate::errors::{PipelineError, PipelineResult};

/// A range of effective partition keys with explicit bound inclusivity
#[derive(Debug, Clone, Copy)]
pub struct EpkRange {
    min: u128,
    max: u128,
    min_inclusive: bool,
    max_inclusive: bool,
}

impl EpkRange {
    /// The whole key space, `["", "FF")`
    pub fn full() -> Self {
        Self {
            min: MIN_EPK,
            max: MAX_EPK,
            min_inclusive: true,
            max_inclusive: false,
        }
    }

    /// Half-open range `[min, max)` from hex keys
    pub fn new(min: &str, max: &str) -> PipelineResult<Self> {
        Self::with_inclusivity(min, max, true, false)
    }

    /// Range from hex keys with explicit inclusivity
    pub fn with_inclusivity(
        min: &str,
        max: &str,
        min_inclusive: bool,
        max_inclusive: bool,
    ) -> PipelineResult<Self> {
        let min = parse_epk(min).map_err(PipelineError::InvalidArgument)?;
        let max = parse_epk(max).map_err(PipelineError::InvalidArgument)?;
        Self::from_raw(min, max, min_inclusive, max_inclusive)
    }

    /// Half-open range `[start, end)` over padded keys
    pub(crate) fn half_open(start: u128, end: u128) -> PipelineResult<Self> {
        Self::from_raw(start, end, true, false)
    }

    /// An inclusive `FF` end is stored as the exclusive end of the key space
    fn from_raw(
        min: u128,
        max: u128,
        min_inclusive: bool,
        max_inclusive: bool,
    ) -> PipelineResult<Self> {
        let (max, max_inclusive) = if max_inclusive && max == MAX_EPK {
            (MAX_EPK, false)
        } else {
            (max, max_inclusive)
        };
        let range = Self {
            min,
            max,
            min_inclusive,
            max_inclusive,
        };
        let (start, end) = range.bounds();
        if start >= end || end > MAX_EPK {
            return Err(PipelineError::InvalidArgument(format!(
                "empty or out-of-space range {}",
                range
            )));
        }
        Ok(range)
    }

    /// Normalized half-open bounds `[start, end)`
    pub fn bounds(&self) -> (u128, u128) {
        let start = if self.min_inclusive {
            self.min
        } else {
            self.min.saturating_add(1)
        };
        let end = if self.max_inclusive {
            self.max.saturating_add(1)
        } else {
            self.max
        };
        (start, end)
    }

    pub fn min_key(&self) -> String {
        format_epk(self.min)
    }

    pub fn max_key(&self) -> String {
        format_epk(self.max)
    }

    pub fn is_min_inclusive(&self) -> bool {
        self.min_inclusive
    }

    pub fn is_max_inclusive(&self) -> bool {
        self.max_inclusive
    }

    pub fn is_full(&self) -> bool {
        self.bounds() == (MIN_EPK, MAX_EPK)
    }

    pub fn contains(&self, other: &EpkRange) -> bool {
        let (start, end) = self.bounds();
        let (other_start, other_end) = other.bounds();
        start <= other_start && other_end <= end
    }

    pub fn overlaps(&self, other: &EpkRange) -> bool {
        let (start, end) = self.bounds();
        let (other_start, other_end) = other.bounds();
        start < other_end && other_start < end
    }

    pub fn intersect(&self, other: &EpkRange) -> Option<EpkRange> {
        if !self.overlaps(other) {
            return None;
        }
        let (start, end) = self.bounds();
        let (other_start, other_end) = other.bounds();
        Self::half_open(start.max(other_start), end.min(other_end)).ok()
    }
}

impl PartialEq for EpkRange {
    fn eq(&self, other: &Self) -> bool {
        self.bounds() == other.bounds()
    }
}

impl Eq for EpkRange {}

impl fmt::Display for EpkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{},{}{}",
            if self.min_inclusive { '[' } else { '(' },
            self.min_key(),
            self.max_key(),
            if self.max_inclusive { ']' } else { ')' },
        )
    }
}

/// An identifier for a contiguous slice of the key space
#[derive(Debug, Clone)]
pub enum FeedRange {
    /// Every key
    Full,
    /// Explicit effective-key bounds
    EffectiveKey(EpkRange),
    /// All documents of one logical partition key
    PartitionKey(Value),
}

impl FeedRange {
    /// Effective-key range, collapsing the full space to [`FeedRange::Full`]
    pub fn effective(range: EpkRange) -> Self {
        if range.is_full() && range.is_min_inclusive() && !range.is_max_inclusive() {
            FeedRange::Full
        } else {
            FeedRange::EffectiveKey(range)
        }
    }

    /// Half-open effective-key range from hex bounds
    pub fn from_keys(min: &str, max: &str) -> PipelineResult<Self> {
        Ok(Self::effective(EpkRange::new(min, max)?))
    }

    pub fn partition_key(value: Value) -> Self {
        FeedRange::PartitionKey(value)
    }

    /// The effective-key slice this range covers
    pub fn epk_range(&self) -> EpkRange {
        match self {
            FeedRange::Full => EpkRange::full(),
            FeedRange::EffectiveKey(range) => *range,
            FeedRange::PartitionKey(value) => {
                let point = partition_key_epk(value);
                EpkRange {
                    min: point,
                    max: point,
                    min_inclusive: true,
                    max_inclusive: true,
                }
            }
        }
    }

    /// Normalized half-open bounds
    pub fn bounds(&self) -> (u128, u128) {
        self.epk_range().bounds()
    }

    pub fn is_partition_key(&self) -> bool {
        matches!(self, FeedRange::PartitionKey(_))
    }

    pub fn contains(&self, other: &FeedRange) -> bool {
        self.epk_range().contains(&other.epk_range())
    }

    pub fn overlaps(&self, other: &FeedRange) -> bool {
        self.epk_range().overlaps(&other.epk_range())
    }

    /// Common slice of two ranges.
    ///
    /// A logical partition key inside the other range stays a logical key.
    pub fn intersect(&self, other: &FeedRange) -> Option<FeedRange> {
        if self.is_partition_key() && other.contains(self) {
            return Some(self.clone());
        }
        if other.is_partition_key() && self.contains(other) {
            return Some(other.clone());
        }
        self.epk_range()
            .intersect(&other.epk_range())
            .map(FeedRange::effective)
    }

    /// Whether `other` starts exactly where this range ends, or vice versa
    pub fn is_adjacent(&self, other: &FeedRange) -> bool {
        if self.is_partition_key() || other.is_partition_key() {
            return false;
        }
        let (start, end) = self.bounds();
        let (other_start, other_end) = other.bounds();
        end == other_start || other_end == start
    }

    /// Split at the midpoint of the key space slice
    pub fn split(&self) -> PipelineResult<(FeedRange, FeedRange)> {
        if self.is_partition_key() {
            return Err(PipelineError::UnsupportedOperation(
                "a logical partition key range cannot be split".to_string(),
            ));
        }
        let (start, end) = self.bounds();
        if end - start < 2 {
            return Err(PipelineError::InvalidArgument(format!(
                "range {} is too narrow to split",
                self
            )));
        }
        let mid = start + (end - start) / 2;
        Ok((
            FeedRange::effective(EpkRange::half_open(start, mid)?),
            FeedRange::effective(EpkRange::half_open(mid, end)?),
        ))
    }

    /// Merge two adjacent siblings into one range
    pub fn merge(&self, other: &FeedRange) -> PipelineResult<FeedRange> {
        if !self.is_adjacent(other) {
            return Err(PipelineError::InvalidArgument(format!(
                "ranges {} and {} are not adjacent",
                self, other
            )));
        }
        let (start, end) = self.bounds();
        let (other_start, other_end) = other.bounds();
        Ok(FeedRange::effective(EpkRange::half_open(
            start.min(other_start),
            end.max(other_end),
        )?))
    }
}

impl PartialEq for FeedRange {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FeedRange::PartitionKey(a), FeedRange::PartitionKey(b)) => a == b,
            (FeedRange::PartitionKey(_), _) | (_, FeedRange::PartitionKey(_)) => false,
            (a, b) => a.epk_range() == b.epk_range(),
        }
    }
}

impl fmt::Display for FeedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedRange::Full => write!(f, "{}", EpkRange::full()),
            FeedRange::EffectiveKey(range) => write!(f, "{}", range),
            FeedRange::PartitionKey(value) => write!(f, "pk({})", value),
        }
    }
}
