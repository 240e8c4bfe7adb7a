//! Capability interface of a block storage engine, as consumed by the migration pipeline.
//!
//! The pipeline never depends on a concrete on-disk format. [`crate::block::DiskEngine`] is the
//! bundled implementation; tests and other engines plug in through these traits.

use crate::error::StorageError;
use crate::types::{ChunkMeta, ChunkRef, Labels, Sample, SeriesRef};
use std::path::Path;

/// Series references matching a postings lookup, in the engine's posting order.
///
/// An `Err` item means the postings list could not be iterated further.
pub type Postings<'a> = Box<dyn Iterator<Item = Result<SeriesRef, StorageError>> + 'a>;

/// Samples of one chunk, in non-decreasing timestamp order.
pub type SampleIter<'a> = Box<dyn Iterator<Item = Result<Sample, StorageError>> + 'a>;

/// Explicit release of a reader handle.
///
/// `close` consumes the reader, so a handle cannot be released twice.
pub trait Close: Sized {
    fn close(self) -> Result<(), StorageError>;
}

/// Opens blocks by path.
pub trait StorageEngine {
    type Block: Block;

    fn open_block(&self, path: &Path) -> Result<Self::Block, StorageError>;
}

/// One immutable block.
pub trait Block {
    type Index: IndexReader;
    type Chunks: ChunkReader;

    fn path(&self) -> &Path;

    fn index(&self) -> Result<Self::Index, StorageError>;

    fn chunks(&self) -> Result<Self::Chunks, StorageError>;
}

/// Inverted index of a block.
pub trait IndexReader: Close {
    /// Returns the series whose label `name` equals `value`.
    fn postings(&self, name: &str, value: &str) -> Result<Postings<'_>, StorageError>;

    /// Resolves a series reference to its stored labels and chunk list.
    fn series(&self, series: SeriesRef) -> Result<(Labels, Vec<ChunkMeta>), StorageError>;
}

/// Chunk data of a block.
pub trait ChunkReader: Close {
    type Chunk: Chunk;

    fn chunk(&mut self, chunk: ChunkRef) -> Result<Self::Chunk, StorageError>;
}

/// A fetched, still-encoded chunk.
pub trait Chunk {
    /// Number of raw samples stored in the chunk.
    fn num_samples(&self) -> usize;

    fn samples(&self) -> SampleIter<'_>;
}
