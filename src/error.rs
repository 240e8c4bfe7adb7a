use crate::types::{ChunkRef, SeriesRef};
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a block storage engine.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Corruption detected in {path:?}: {details}")]
    Corruption { path: PathBuf, details: String },

    #[error("Unknown series reference {0}")]
    UnknownSeries(SeriesRef),

    #[error("Unknown chunk reference {0}")]
    UnknownChunk(ChunkRef),

    #[error("Malformed chunk data: {0}")]
    MalformedChunk(String),

    #[error("Not a block: {0:?}")]
    NotABlock(PathBuf),

    #[error("Invalid series: {0}")]
    InvalidSeries(String),
}

impl StorageError {
    pub(crate) fn corruption(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        StorageError::Corruption {
            path: path.into(),
            details: details.into(),
        }
    }
}

/// Fatal errors. Any of these aborts the whole migration run.
#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("list blocks under {path:?}: {source}")]
    ListBlocks {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("open block {path:?}: {source}")]
    OpenBlock {
        path: PathBuf,
        #[source]
        source: StorageError,
    },

    #[error("open index reader of {path:?}: {source}")]
    IndexReader {
        path: PathBuf,
        #[source]
        source: StorageError,
    },

    #[error("open chunk reader of {path:?}: {source}")]
    ChunkReader {
        path: PathBuf,
        #[source]
        source: StorageError,
    },

    #[error("resolve postings {name}={value:?} in {path:?}: {source}")]
    Postings {
        path: PathBuf,
        name: String,
        value: String,
        #[source]
        source: StorageError,
    },

    #[error("resolve {series} in {path:?}: {source}")]
    Series {
        path: PathBuf,
        series: SeriesRef,
        #[source]
        source: StorageError,
    },

    #[error("fetch {chunk} in {path:?}: {source}")]
    Chunk {
        path: PathBuf,
        chunk: ChunkRef,
        #[source]
        source: StorageError,
    },

    #[error("decode {chunk} in {path:?}: {source}")]
    Decode {
        path: PathBuf,
        chunk: ChunkRef,
        #[source]
        source: StorageError,
    },

    #[error("release readers of {path:?}: {source}")]
    Close {
        path: PathBuf,
        #[source]
        source: StorageError,
    },

    #[error("decode external labels: {0}")]
    ExternalLabels(#[source] serde_json::Error),

    #[error("Configuration Error: {0}")]
    Config(String),
}

/// Errors returned by a sink. These never abort a run.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Batch rejected: {0}")]
    Rejected(String),
}
