//! Bundled on-disk block engine.
//!
//! A block is a directory holding three files:
//!
//! ```text
//! meta.json  BlockMeta (JSON), written last
//! index      magic(8) version(u32) payload_len(u64) crc32(u32) bincode(IndexPayload)
//! chunks     magic(8) version(u32) then records: len(u32) crc32(u32) chunk payload
//! ```
//!
//! A [`SeriesRef`] is the ordinal of a series in the index's series table (series are stored
//! sorted by label set). A [`ChunkRef`] is the byte offset of a chunk record in `chunks`.
//! Postings map each `(name, value)` pair to a roaring bitmap of series ordinals.

use crate::encoding::{
    crc32, encode_chunk, parse_chunk_layout, read_u32, read_u64, write_u32, write_u64,
    ChunkDecoder, ChunkLayout,
};
use crate::error::StorageError;
use crate::storage::{Block, Chunk, ChunkReader, Close, IndexReader, Postings, SampleIter, StorageEngine};
use crate::types::{ChunkMeta, ChunkRef, Label, Labels, Sample, SeriesRef, Timestamp};

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const META_FILE: &str = "meta.json";
pub const INDEX_FILE: &str = "index";
pub const CHUNKS_FILE: &str = "chunks";

const INDEX_MAGIC: &[u8; 8] = b"TSMIDX01";
const CHUNKS_MAGIC: &[u8; 8] = b"TSMCHK01";

const INDEX_VERSION: u32 = 1;
const CHUNKS_VERSION: u32 = 1;
const BLOCK_META_VERSION: u32 = 1;

const CHUNKS_HEADER_LEN: u64 = 8 + 4; // magic + version
const CHUNK_RECORD_HEADER_LEN: u64 = 4 + 4; // len + crc32

/// Contents of `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: String,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub stats: BlockStats,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub num_series: u64,
    pub num_chunks: u64,
    pub num_samples: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexPayload {
    series: Vec<SeriesRecord>,
    postings: Vec<PostingsRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeriesRecord {
    labels: Labels,
    chunks: Vec<ChunkMeta>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PostingsRecord {
    name: String,
    value: String,
    /// Serialized [`RoaringBitmap`] of series ordinals.
    bitmap: Vec<u8>,
}

/// Opens block directories written by [`BlockWriter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskEngine;

impl StorageEngine for DiskEngine {
    type Block = DiskBlock;

    fn open_block(&self, path: &Path) -> Result<DiskBlock, StorageError> {
        DiskBlock::open(path)
    }
}

#[derive(Debug)]
pub struct DiskBlock {
    path: PathBuf,
    meta: BlockMeta,
}

impl DiskBlock {
    /// Opens a block directory and validates its `meta.json`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if !path.is_dir() {
            return Err(StorageError::NotABlock(path.to_path_buf()));
        }
        let meta_path = path.join(META_FILE);
        let bytes = fs::read(&meta_path)?;
        let meta: BlockMeta = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::Serialization(format!("{:?}: {}", meta_path, e)))?;
        if meta.version != BLOCK_META_VERSION {
            return Err(StorageError::corruption(
                meta_path,
                format!("Unsupported block meta version {}", meta.version),
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            meta,
        })
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }
}

impl Block for DiskBlock {
    type Index = DiskIndexReader;
    type Chunks = DiskChunkReader;

    fn path(&self) -> &Path {
        &self.path
    }

    fn index(&self) -> Result<DiskIndexReader, StorageError> {
        DiskIndexReader::open(&self.path.join(INDEX_FILE))
    }

    fn chunks(&self) -> Result<DiskChunkReader, StorageError> {
        DiskChunkReader::open(&self.path.join(CHUNKS_FILE))
    }
}

/// In-memory view of a block's `index` file.
#[derive(Debug)]
pub struct DiskIndexReader {
    series: Vec<SeriesRecord>,
    postings: HashMap<String, HashMap<String, RoaringBitmap>>,
}

impl DiskIndexReader {
    fn open(path: &Path) -> Result<Self, StorageError> {
        let mut f = File::open(path)?;
        let mut magic = [0u8; 8];
        f.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            return Err(StorageError::corruption(path, "Bad index magic"));
        }
        let version = read_u32(&mut f)?;
        if version != INDEX_VERSION {
            return Err(StorageError::corruption(
                path,
                format!("Unsupported index version {}", version),
            ));
        }
        let len = read_u64(&mut f)?;
        let crc = read_u32(&mut f)?;
        let file_len = f.metadata()?.len();
        if len > file_len {
            return Err(StorageError::corruption(path, "Truncated index payload"));
        }
        let mut buf = vec![0u8; len as usize];
        f.read_exact(&mut buf)
            .map_err(|_| StorageError::corruption(path, "Truncated index payload"))?;
        if crc32(&buf) != crc {
            return Err(StorageError::corruption(path, "Index CRC mismatch"));
        }

        let payload: IndexPayload =
            bincode::deserialize(&buf).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let series_count = payload.series.len() as u64;
        let mut postings: HashMap<String, HashMap<String, RoaringBitmap>> = HashMap::new();
        for rec in payload.postings {
            let bitmap = RoaringBitmap::deserialize_from(&rec.bitmap[..]).map_err(|e| {
                StorageError::corruption(
                    path,
                    format!("Bad postings bitmap for {}={:?}: {}", rec.name, rec.value, e),
                )
            })?;
            if bitmap.max().is_some_and(|m| u64::from(m) >= series_count) {
                return Err(StorageError::corruption(
                    path,
                    format!("Postings for {}={:?} reference unknown series", rec.name, rec.value),
                ));
            }
            postings.entry(rec.name).or_default().insert(rec.value, bitmap);
        }

        Ok(Self {
            series: payload.series,
            postings,
        })
    }

}

impl IndexReader for DiskIndexReader {
    /// An empty `name` and `value` selects every series of the block. Any other pair missing
    /// from the index selects nothing.
    fn postings(&self, name: &str, value: &str) -> Result<Postings<'_>, StorageError> {
        if name.is_empty() && value.is_empty() {
            let all = (0..self.series.len() as u64).map(|id| Ok::<_, StorageError>(SeriesRef(id)));
            return Ok(Box::new(all));
        }
        match self.postings.get(name).and_then(|values| values.get(value)) {
            Some(bitmap) => {
                let refs = bitmap
                    .iter()
                    .map(|id| Ok::<_, StorageError>(SeriesRef(u64::from(id))));
                Ok(Box::new(refs))
            }
            None => Ok(Box::new(std::iter::empty::<Result<SeriesRef, StorageError>>())),
        }
    }

    fn series(&self, series: SeriesRef) -> Result<(Labels, Vec<ChunkMeta>), StorageError> {
        let rec = usize::try_from(series.0)
            .ok()
            .and_then(|i| self.series.get(i))
            .ok_or(StorageError::UnknownSeries(series))?;
        Ok((rec.labels.clone(), rec.chunks.clone()))
    }
}

impl Close for DiskIndexReader {
    fn close(self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Reader over a block's `chunks` file. Holds the file open until closed.
#[derive(Debug)]
pub struct DiskChunkReader {
    path: PathBuf,
    file: File,
    len: u64,
}

impl DiskChunkReader {
    fn open(path: &Path) -> Result<Self, StorageError> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != CHUNKS_MAGIC {
            return Err(StorageError::corruption(path, "Bad chunks magic"));
        }
        let version = read_u32(&mut file)?;
        if version != CHUNKS_VERSION {
            return Err(StorageError::corruption(
                path,
                format!("Unsupported chunks version {}", version),
            ));
        }
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }
}

impl ChunkReader for DiskChunkReader {
    type Chunk = DiskChunk;

    fn chunk(&mut self, chunk: ChunkRef) -> Result<DiskChunk, StorageError> {
        let offset = chunk.0;
        if offset < CHUNKS_HEADER_LEN || offset.saturating_add(CHUNK_RECORD_HEADER_LEN) > self.len {
            return Err(StorageError::UnknownChunk(chunk));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let len = u64::from(read_u32(&mut self.file)?);
        let crc = read_u32(&mut self.file)?;
        if len > self.len - offset - CHUNK_RECORD_HEADER_LEN {
            return Err(StorageError::corruption(
                &self.path,
                format!("Truncated {}", chunk),
            ));
        }
        let mut bytes = vec![0u8; len as usize];
        self.file.read_exact(&mut bytes)?;
        if crc32(&bytes) != crc {
            return Err(StorageError::corruption(
                &self.path,
                format!("CRC mismatch in {}", chunk),
            ));
        }
        let layout = parse_chunk_layout(&bytes)?;
        Ok(DiskChunk { bytes, layout })
    }
}

impl Close for DiskChunkReader {
    fn close(self) -> Result<(), StorageError> {
        drop(self.file);
        Ok(())
    }
}

/// A fetched chunk; samples are decoded lazily.
#[derive(Debug, Clone)]
pub struct DiskChunk {
    bytes: Vec<u8>,
    layout: ChunkLayout,
}

impl Chunk for DiskChunk {
    fn num_samples(&self) -> usize {
        self.layout.count
    }

    fn samples(&self) -> SampleIter<'_> {
        Box::new(ChunkDecoder::new(&self.bytes, self.layout))
    }
}

/// Writes a new block directory.
///
/// Used to produce fixtures and test data; the migration itself never writes blocks.
/// The block only becomes openable once [`BlockWriter::finish`] has written `meta.json`.
#[derive(Debug)]
pub struct BlockWriter {
    dir: PathBuf,
    chunks: BufWriter<File>,
    offset: u64,
    series: Vec<SeriesRecord>,
    stats: BlockStats,
    min_time: Timestamp,
    max_time: Timestamp,
}

impl BlockWriter {
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        if dir.join(META_FILE).exists() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("block already exists at {:?}", dir),
            )));
        }
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.join(CHUNKS_FILE))?;
        let mut chunks = BufWriter::new(file);
        chunks.write_all(CHUNKS_MAGIC)?;
        chunks.write_all(&CHUNKS_VERSION.to_le_bytes())?;

        Ok(Self {
            dir,
            chunks,
            offset: CHUNKS_HEADER_LEN,
            series: Vec::new(),
            stats: BlockStats::default(),
            min_time: Timestamp::MAX,
            max_time: Timestamp::MIN,
        })
    }

    /// Appends one series with its chunks, in the given chunk order.
    ///
    /// Labels are stored sorted by name. Duplicate or empty label names are rejected, as are
    /// chunks whose timestamps decrease. Empty chunks are allowed.
    pub fn add_series(&mut self, labels: Labels, chunks: &[Vec<Sample>]) -> Result<(), StorageError> {
        let mut sorted = labels.into_vec();
        sorted.sort();
        let labels = Labels::new(sorted);
        if let Some(name) = labels.duplicate_name() {
            return Err(StorageError::InvalidSeries(format!(
                "Duplicate label name {:?} in {}",
                name, labels
            )));
        }
        if labels.iter().any(|l| l.name.is_empty()) {
            return Err(StorageError::InvalidSeries(format!(
                "Empty label name in {}",
                labels
            )));
        }

        // Nothing reaches the chunks file until every chunk of the series is valid.
        let mut payloads = Vec::with_capacity(chunks.len());
        for samples in chunks {
            if samples.windows(2).any(|w| w[1].timestamp < w[0].timestamp) {
                return Err(StorageError::InvalidSeries(format!(
                    "Chunk timestamps decrease in {}",
                    labels
                )));
            }
            payloads.push(encode_chunk(samples)?);
        }

        let mut metas = Vec::with_capacity(chunks.len());
        for (samples, payload) in chunks.iter().zip(payloads) {
            metas.push(self.write_chunk(samples, payload)?);
        }

        self.stats.num_series += 1;
        self.series.push(SeriesRecord {
            labels,
            chunks: metas,
        });
        Ok(())
    }

    fn write_chunk(&mut self, samples: &[Sample], payload: Vec<u8>) -> Result<ChunkMeta, StorageError> {
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| StorageError::InvalidSeries("Chunk too large".to_string()))?;
        let chunk_ref = ChunkRef(self.offset);

        let mut header = Vec::with_capacity(CHUNK_RECORD_HEADER_LEN as usize);
        write_u32(&mut header, len);
        write_u32(&mut header, crc32(&payload));
        self.chunks.write_all(&header)?;
        self.chunks.write_all(&payload)?;
        self.offset += CHUNK_RECORD_HEADER_LEN + u64::from(len);

        let (min_time, max_time) = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => (0, 0),
        };
        if !samples.is_empty() {
            self.min_time = self.min_time.min(min_time);
            self.max_time = self.max_time.max(max_time);
        }
        self.stats.num_chunks += 1;
        self.stats.num_samples += samples.len() as u64;

        Ok(ChunkMeta {
            chunk_ref,
            min_time,
            max_time,
        })
    }

    /// Writes the index and `meta.json`, making the block openable.
    pub fn finish(mut self) -> Result<BlockMeta, StorageError> {
        self.chunks.flush()?;
        self.chunks.get_ref().sync_data()?;

        self.series.sort_by(|a, b| a.labels.cmp(&b.labels));
        if let Some(w) = self.series.windows(2).find(|w| w[0].labels == w[1].labels) {
            return Err(StorageError::InvalidSeries(format!(
                "Series {} added twice",
                w[0].labels
            )));
        }

        let mut by_pair: BTreeMap<(&str, &str), RoaringBitmap> = BTreeMap::new();
        for (ordinal, series) in self.series.iter().enumerate() {
            let ordinal: u32 = ordinal
                .try_into()
                .map_err(|_| StorageError::InvalidSeries("Too many series in block".to_string()))?;
            for Label { name, value } in series.labels.iter() {
                by_pair
                    .entry((name.as_str(), value.as_str()))
                    .or_default()
                    .insert(ordinal);
            }
        }
        let mut postings = Vec::with_capacity(by_pair.len());
        for ((name, value), bitmap) in by_pair {
            let mut bytes = Vec::with_capacity(bitmap.serialized_size());
            bitmap.serialize_into(&mut bytes)?;
            postings.push(PostingsRecord {
                name: name.to_string(),
                value: value.to_string(),
                bitmap: bytes,
            });
        }

        let payload = IndexPayload {
            series: std::mem::take(&mut self.series),
            postings,
        };
        let bytes =
            bincode::serialize(&payload).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(INDEX_MAGIC);
        write_u32(&mut header, INDEX_VERSION);
        write_u64(&mut header, bytes.len() as u64);
        write_u32(&mut header, crc32(&bytes));

        let mut index = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(self.dir.join(INDEX_FILE))?,
        );
        index.write_all(&header)?;
        index.write_all(&bytes)?;
        index.flush()?;
        index.get_ref().sync_data()?;

        let (min_time, max_time) = if self.stats.num_samples == 0 {
            (0, 0)
        } else {
            (self.min_time, self.max_time)
        };
        let meta = BlockMeta {
            id: self
                .dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            min_time,
            max_time,
            stats: self.stats,
            version: BLOCK_META_VERSION,
        };
        write_meta_atomic(&self.dir, &meta)?;
        Ok(meta)
    }
}

fn write_meta_atomic(dir: &Path, meta: &BlockMeta) -> Result<(), StorageError> {
    let bytes =
        serde_json::to_vec_pretty(meta).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let tmp_path = dir.join(format!("{}.tmp", META_FILE));
    let mut w = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?,
    );
    w.write_all(&bytes)?;
    w.flush()?;
    w.get_ref().sync_data()?;
    drop(w);
    fs::rename(&tmp_path, dir.join(META_FILE))?;
    Ok(())
}
