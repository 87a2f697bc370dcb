//! Running Mean Aggregation
//!
//! Folds validated frames into a per-channel mean in O(1) per frame, using
//! the incremental (Welford) form `mean += (x - mean) / n` so long captures do
//! not accumulate large sums.
//!
//! ## Ownership
//!
//! An aggregator has exactly one writer: the acquisition worker owns it while
//! a phase is gathering and hands it back to the controller when it exits.
//! After handback the count is frozen.

use crate::types::SensorFrame;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AggregationError {
    /// Snapshot requested before any frame was folded in.
    #[error("no frames were aggregated")]
    EmptyAggregation,

    #[error("frame has {found} channels, aggregator expects {expected}")]
    ChannelMismatch { expected: usize, found: usize },
}

// ============================================================================
// Mean Aggregator
// ============================================================================

/// Count-weighted running mean per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanAggregator {
    means: Vec<f64>,
    count: u64,
}

impl MeanAggregator {
    /// Zeroed accumulators for `channel_count` channels.
    pub fn new(channel_count: usize) -> Self {
        Self {
            means: vec![0.0; channel_count],
            count: 0,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.means.len()
    }

    /// Frames folded in so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Fold one frame into the running mean.
    pub fn update(&mut self, frame: &SensorFrame) -> Result<(), AggregationError> {
        if frame.len() != self.means.len() {
            return Err(AggregationError::ChannelMismatch {
                expected: self.means.len(),
                found: frame.len(),
            });
        }

        self.count += 1;
        let n = self.count as f64;
        for (mean, value) in self.means.iter_mut().zip(frame.values()) {
            // Split form: `value - mean` overflows for huge readings of opposite sign
            *mean += value / n - *mean / n;
        }
        Ok(())
    }

    /// Current mean per channel. Accumulation may continue afterwards.
    pub fn snapshot(&self) -> Result<Vec<f64>, AggregationError> {
        if self.count == 0 {
            return Err(AggregationError::EmptyAggregation);
        }
        Ok(self.means.clone())
    }
}
