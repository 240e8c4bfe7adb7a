//! The migration run: blocks, then matched series, then chunks, then filtered batches to the sink.
//!
//! Traversal is sequential and depth-first. Every storage failure aborts the run with a
//! [`MigrateError`] naming the operation and its context; sink failures are reported through the
//! event listener and counted, and traversal continues.

use crate::batch::{Batch, BatchAssembler};
use crate::config::MigrateConfig;
use crate::error::{MigrateError, StorageError};
use crate::filter::SampleFilter;
use crate::labels::merge_labels;
use crate::sink::Sink;
use crate::storage::{Block, Chunk, ChunkReader, Close, IndexReader, StorageEngine};
use crate::telemetry::{migrate_metrics, MigrationEvent, MigrationEventListener};
use crate::types::SeriesRef;

use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Counters of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    /// Blocks fully processed.
    pub blocks: u64,
    /// Series matched by the predicate.
    pub series: u64,
    /// Chunks fetched and decoded.
    pub chunks: u64,
    pub batches_sent: u64,
    pub samples_sent: u64,
    /// Samples removed by the filter (non-finite or out of window).
    pub samples_dropped: u64,
    pub ingest_failures: u64,
    /// Samples in batches the sink failed to ingest.
    pub samples_failed: u64,
}

/// Lists the entries of `root` in directory-listing order.
pub fn list_blocks(root: &Path) -> Result<Vec<PathBuf>, MigrateError> {
    let list_err = |source| MigrateError::ListBlocks {
        path: root.to_path_buf(),
        source,
    };
    let mut blocks = Vec::new();
    for entry in fs::read_dir(root).map_err(list_err)? {
        blocks.push(entry.map_err(list_err)?.path());
    }
    Ok(blocks)
}

/// Migrates every block under `config.snapshot_path`.
pub fn migrate<E, S>(
    engine: &E,
    sink: &mut S,
    config: &MigrateConfig,
) -> Result<MigrationStats, MigrateError>
where
    E: StorageEngine,
    S: Sink + ?Sized,
{
    let blocks = match list_blocks(&config.snapshot_path) {
        Ok(blocks) => blocks,
        Err(e) => {
            config.event_listener.on_event(MigrationEvent::RunAborted {
                error: e.to_string(),
            });
            return Err(e);
        }
    };
    migrate_blocks(engine, sink, config, blocks)
}

/// Migrates the given block paths, in order.
///
/// The first fatal error stops the run; batches already handed to the sink stay sent.
pub fn migrate_blocks<E, S, I>(
    engine: &E,
    sink: &mut S,
    config: &MigrateConfig,
    blocks: I,
) -> Result<MigrationStats, MigrateError>
where
    E: StorageEngine,
    S: Sink + ?Sized,
    I: IntoIterator<Item = PathBuf>,
{
    let listener = config.event_listener.as_ref();
    let blocks: Vec<PathBuf> = blocks.into_iter().collect();
    listener.on_event(MigrationEvent::RunStarted {
        root: config.snapshot_path.clone(),
        blocks: blocks.len(),
    });

    let filter = config.sample_filter();
    let mut stats = MigrationStats::default();
    for path in &blocks {
        if let Err(e) = migrate_block(engine, sink, config, &filter, path, &mut stats) {
            listener.on_event(MigrationEvent::RunAborted {
                error: e.to_string(),
            });
            return Err(e);
        }
    }

    listener.on_event(MigrationEvent::RunFinished { stats });
    Ok(stats)
}

fn migrate_block<E, S>(
    engine: &E,
    sink: &mut S,
    config: &MigrateConfig,
    filter: &SampleFilter,
    path: &Path,
    stats: &mut MigrationStats,
) -> Result<(), MigrateError>
where
    E: StorageEngine,
    S: Sink + ?Sized,
{
    let listener = config.event_listener.as_ref();
    let started = Instant::now();

    let block = engine
        .open_block(path)
        .map_err(|source| MigrateError::OpenBlock {
            path: path.to_path_buf(),
            source,
        })?;
    listener.on_event(MigrationEvent::BlockOpened {
        path: path.to_path_buf(),
    });

    let index = Scoped::new(
        block.index().map_err(|source| MigrateError::IndexReader {
            path: path.to_path_buf(),
            source,
        })?,
        block.path(),
        listener,
    );
    let mut chunks = Scoped::new(
        block.chunks().map_err(|source| MigrateError::ChunkReader {
            path: path.to_path_buf(),
            source,
        })?,
        block.path(),
        listener,
    );

    let before = *stats;
    let ctx = BlockContext {
        path,
        config,
        filter,
        listener,
    };
    ctx.traverse(&*index, &mut *chunks, sink, stats)?;

    let close_err = |source| MigrateError::Close {
        path: path.to_path_buf(),
        source,
    };
    index.close().map_err(close_err)?;
    chunks.close().map_err(close_err)?;

    stats.blocks += 1;
    let series = stats.series - before.series;
    migrate_metrics::record_block(started.elapsed(), series);
    listener.on_event(MigrationEvent::BlockFinished {
        path: path.to_path_buf(),
        series,
        batches: stats.batches_sent - before.batches_sent,
        samples: stats.samples_sent - before.samples_sent,
    });
    Ok(())
}

struct BlockContext<'a> {
    path: &'a Path,
    config: &'a MigrateConfig,
    filter: &'a SampleFilter,
    listener: &'a dyn MigrationEventListener,
}

impl BlockContext<'_> {
    fn traverse<X, C, S>(
        &self,
        index: &X,
        chunks: &mut C,
        sink: &mut S,
        stats: &mut MigrationStats,
    ) -> Result<(), MigrateError>
    where
        X: IndexReader,
        C: ChunkReader,
        S: Sink + ?Sized,
    {
        let (name, value) = (&self.config.label_key, &self.config.label_value);
        let postings_err = |source| MigrateError::Postings {
            path: self.path.to_path_buf(),
            name: name.clone(),
            value: value.clone(),
            source,
        };

        for series in index.postings(name, value).map_err(postings_err)? {
            let series = series.map_err(postings_err)?;
            let (stored, metas) = index
                .series(series)
                .map_err(|source| MigrateError::Series {
                    path: self.path.to_path_buf(),
                    series,
                    source,
                })?;
            stats.series += 1;

            let labels = merge_labels(
                &stored,
                &self.config.external_labels,
                self.config.label_collision,
            );
            let mut assembler = BatchAssembler::new(labels, self.config.batch_mode);

            for meta in &metas {
                let chunk = chunks
                    .chunk(meta.chunk_ref)
                    .map_err(|source| MigrateError::Chunk {
                        path: self.path.to_path_buf(),
                        chunk: meta.chunk_ref,
                        source,
                    })?;
                let filtered = self
                    .filter
                    .apply(chunk.samples())
                    .map_err(|source: StorageError| MigrateError::Decode {
                        path: self.path.to_path_buf(),
                        chunk: meta.chunk_ref,
                        source,
                    })?;
                stats.chunks += 1;
                stats.samples_dropped += filtered.dropped();
                migrate_metrics::record_samples_dropped(filtered.dropped());

                if let Some(batch) = assembler.push_chunk(filtered.samples) {
                    self.send(sink, series, batch, stats);
                }
            }
            if let Some(batch) = assembler.finish() {
                self.send(sink, series, batch, stats);
            }
        }
        Ok(())
    }

    fn send<S: Sink + ?Sized>(
        &self,
        sink: &mut S,
        series: SeriesRef,
        batch: Batch,
        stats: &mut MigrationStats,
    ) {
        let samples = batch.len();
        match sink.ingest(&batch) {
            Ok(accepted) => {
                stats.batches_sent += 1;
                stats.samples_sent += samples as u64;
                migrate_metrics::record_batch_sent(samples as u64);
                self.listener.on_event(MigrationEvent::BatchSent {
                    series,
                    samples,
                    accepted,
                });
            }
            Err(e) => {
                stats.ingest_failures += 1;
                stats.samples_failed += samples as u64;
                migrate_metrics::record_ingest_failure();
                self.listener.on_event(MigrationEvent::IngestFailed {
                    block: self.path.to_path_buf(),
                    series,
                    labels: batch.labels,
                    attempted: samples,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Owns a reader for the duration of one block and releases it exactly once.
///
/// [`close`](Self::close) releases explicitly and reports the error. If the guard is dropped
/// instead (an early return), the reader is released in `Drop` and a failure becomes a
/// [`MigrationEvent::ReaderReleaseFailed`].
pub struct Scoped<'a, R: Close> {
    reader: Option<R>,
    path: &'a Path,
    listener: &'a dyn MigrationEventListener,
}

impl<'a, R: Close> Scoped<'a, R> {
    pub fn new(reader: R, path: &'a Path, listener: &'a dyn MigrationEventListener) -> Self {
        Self {
            reader: Some(reader),
            path,
            listener,
        }
    }

    pub fn close(mut self) -> Result<(), StorageError> {
        match self.reader.take() {
            Some(reader) => reader.close(),
            None => Ok(()),
        }
    }
}

impl<R: Close> Deref for Scoped<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        match self.reader.as_ref() {
            Some(reader) => reader,
            // Only `close(self)` and `drop` take the reader.
            None => unreachable!("scoped reader already released"),
        }
    }
}

impl<R: Close> DerefMut for Scoped<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        match self.reader.as_mut() {
            Some(reader) => reader,
            None => unreachable!("scoped reader already released"),
        }
    }
}

impl<R: Close> Drop for Scoped<'_, R> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.close() {
                self.listener.on_event(MigrationEvent::ReaderReleaseFailed {
                    path: self.path.to_path_buf(),
                    error: e.to_string(),
                });
            }
        }
    }
}
