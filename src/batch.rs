//! Remote-write units and their assembly from filtered chunk samples.

use crate::types::{Labels, Sample};

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One outbound unit: a label list plus a non-empty, ordered run of samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// How filtered chunks of one series are grouped into batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchMode {
    /// One batch per (series, chunk).
    #[default]
    PerChunk,
    /// One batch per series holding the surviving samples of all its chunks, in chunk order.
    PerSeries,
}

impl BatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchMode::PerChunk => "per-chunk",
            BatchMode::PerSeries => "per-series",
        }
    }
}

impl FromStr for BatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-chunk" => Ok(BatchMode::PerChunk),
            "per-series" => Ok(BatchMode::PerSeries),
            other => Err(format!(
                "invalid batch mode {:?} (expected \"per-chunk\" or \"per-series\")",
                other
            )),
        }
    }
}

/// Builds the batches of one series.
///
/// Feed each chunk's filtered samples to [`push_chunk`](Self::push_chunk) in storage order, then
/// call [`finish`](Self::finish). Empty batches are never produced.
#[derive(Debug)]
pub struct BatchAssembler {
    labels: Labels,
    mode: BatchMode,
    pending: Vec<Sample>,
}

impl BatchAssembler {
    pub fn new(labels: Labels, mode: BatchMode) -> Self {
        Self {
            labels,
            mode,
            pending: Vec::new(),
        }
    }

    /// Returns a batch to send now, if any.
    pub fn push_chunk(&mut self, samples: Vec<Sample>) -> Option<Batch> {
        if samples.is_empty() {
            return None;
        }
        match self.mode {
            BatchMode::PerChunk => Some(Batch {
                labels: self.labels.clone(),
                samples,
            }),
            BatchMode::PerSeries => {
                self.pending.extend(samples);
                None
            }
        }
    }

    /// Returns the consolidated batch of a per-series assembler, if it holds any samples.
    pub fn finish(self) -> Option<Batch> {
        if self.pending.is_empty() {
            return None;
        }
        Some(Batch {
            labels: self.labels,
            samples: self.pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(t: i64, v: f64) -> Sample {
        Sample::new(t, v)
    }

    #[test]
    fn per_chunk_emits_each_non_empty_chunk() {
        let labels = Labels::from_pairs(&[("job", "x")]);
        let mut asm = BatchAssembler::new(labels.clone(), BatchMode::PerChunk);
        let b1 = asm.push_chunk(vec![s(1, 1.0)]).unwrap();
        assert!(asm.push_chunk(vec![]).is_none());
        let b2 = asm.push_chunk(vec![s(2, 2.0), s(3, 3.0)]).unwrap();
        assert!(asm.finish().is_none());
        assert_eq!(b1.labels, labels);
        assert_eq!(b1.samples, vec![s(1, 1.0)]);
        assert_eq!(b2.len(), 2);
    }

    #[test]
    fn per_series_consolidates_in_chunk_order() {
        let mut asm = BatchAssembler::new(Labels::from_pairs(&[("job", "x")]), BatchMode::PerSeries);
        assert!(asm.push_chunk(vec![s(1, 1.0)]).is_none());
        assert!(asm.push_chunk(vec![]).is_none());
        assert!(asm.push_chunk(vec![s(5, 5.0)]).is_none());
        let batch = asm.finish().unwrap();
        assert_eq!(batch.samples, vec![s(1, 1.0), s(5, 5.0)]);
    }

    #[test]
    fn per_series_with_nothing_surviving_emits_nothing() {
        let mut asm = BatchAssembler::new(Labels::default(), BatchMode::PerSeries);
        assert!(asm.push_chunk(vec![]).is_none());
        assert!(asm.finish().is_none());
    }

    #[test]
    fn batch_mode_round_trips_through_str() {
        for mode in [BatchMode::PerChunk, BatchMode::PerSeries] {
            assert_eq!(mode.as_str().parse::<BatchMode>(), Ok(mode));
        }
        assert!("chunk".parse::<BatchMode>().is_err());
    }
}
