//! Sink adapters: where assembled batches go.

use crate::batch::Batch;
use crate::error::SinkError;

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Remote ingestion endpoint.
///
/// `ingest` is called once per batch, synchronously and in traversal order. It returns the number
/// of samples the sink accepted. An error is reported by the caller and never retried there.
pub trait Sink {
    fn ingest(&mut self, batch: &Batch) -> Result<usize, SinkError>;
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn ingest(&mut self, batch: &Batch) -> Result<usize, SinkError> {
        (**self).ingest(batch)
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn ingest(&mut self, batch: &Batch) -> Result<usize, SinkError> {
        (**self).ingest(batch)
    }
}

/// Writes every batch as one JSON object per line and flushes after each batch.
///
/// Line format: `{"labels":[{"name":..,"value":..},..],"samples":[{"timestamp":..,"value":..},..]}`.
/// Labels are a list so repeated names survive.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesSink<BufWriter<File>> {
    /// Appends to the file at `path`, creating it if needed.
    pub fn append_to_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl JsonLinesSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> Sink for JsonLinesSink<W> {
    fn ingest(&mut self, batch: &Batch) -> Result<usize, SinkError> {
        serde_json::to_writer(&mut self.writer, batch).map_err(|e| {
            if e.is_io() {
                SinkError::Io(e.into())
            } else {
                SinkError::Serialization(e.to_string())
            }
        })?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(batch.len())
    }
}

/// Accepts and drops every batch. Used for dry runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiscardSink {
    pub batches: u64,
    pub samples: u64,
}

impl Sink for DiscardSink {
    fn ingest(&mut self, batch: &Batch) -> Result<usize, SinkError> {
        self.batches += 1;
        self.samples += batch.len() as u64;
        Ok(batch.len())
    }
}
