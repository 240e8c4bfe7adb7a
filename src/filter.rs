//! Sample filtering: drops non-finite values and samples outside the inclusive time window.

use crate::types::{Sample, Timestamp};

/// Inclusive time window plus the finite-value rule. Pure and stateless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFilter {
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
}

impl Default for SampleFilter {
    fn default() -> Self {
        Self {
            min_timestamp: 0,
            max_timestamp: Timestamp::MAX,
        }
    }
}

/// Result of filtering one chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filtered {
    /// Surviving samples, in input order.
    pub samples: Vec<Sample>,
    /// Samples dropped for a NaN or infinite value.
    pub dropped_non_finite: u64,
    /// Finite samples dropped for falling outside the window.
    pub dropped_out_of_range: u64,
}

impl Filtered {
    pub fn dropped(&self) -> u64 {
        self.dropped_non_finite + self.dropped_out_of_range
    }
}

impl SampleFilter {
    /// A window with `min_timestamp > max_timestamp` is legal and accepts nothing.
    pub fn new(min_timestamp: Timestamp, max_timestamp: Timestamp) -> Self {
        Self {
            min_timestamp,
            max_timestamp,
        }
    }

    #[inline]
    pub fn in_window(&self, timestamp: Timestamp) -> bool {
        self.min_timestamp <= timestamp && timestamp <= self.max_timestamp
    }

    /// Filters a fallible sample stream, stopping at the first error.
    pub fn apply<I, E>(&self, samples: I) -> Result<Filtered, E>
    where
        I: IntoIterator<Item = Result<Sample, E>>,
    {
        let mut out = Filtered::default();
        for sample in samples {
            let sample = sample?;
            if !sample.value.is_finite() {
                out.dropped_non_finite += 1;
            } else if !self.in_window(sample.timestamp) {
                out.dropped_out_of_range += 1;
            } else {
                out.samples.push(sample);
            }
        }
        Ok(out)
    }
}
