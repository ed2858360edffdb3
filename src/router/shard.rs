use thiserror::Error;

use crate::router::BackendTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInterval {
    /// Inclusive upper bound.
    pub end: u64,
    pub target: BackendTarget,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShardTableError {
    #[error("shard end {end} must be greater than previous end {previous}")]
    NotAscending { previous: u64, end: u64 },
}

/// Height-ordered shard intervals. Interval `i` covers
/// `(end[i-1], end[i]]`, the first one starting at height zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardIntervalTable {
    intervals: Vec<ShardInterval>,
}

impl ShardIntervalTable {
    pub fn new(intervals: Vec<ShardInterval>) -> Result<Self, ShardTableError> {
        for pair in intervals.windows(2) {
            if pair[1].end <= pair[0].end {
                return Err(ShardTableError::NotAscending {
                    previous: pair[0].end,
                    end: pair[1].end,
                });
            }
        }
        Ok(Self { intervals })
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// The first interval whose upper bound is at or above `height`.
    pub fn lookup(&self, height: u64) -> Option<&ShardInterval> {
        let idx = self.intervals.partition_point(|s| s.end < height);
        self.intervals.get(idx)
    }
}
