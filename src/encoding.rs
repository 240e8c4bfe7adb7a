//! Chunk encoding: zigzag varint timestamp deltas plus Gorilla XOR float bits, and the
//! little-endian / CRC helpers shared by the block files.

use crate::error::StorageError;
use crate::types::{Sample, Timestamp};

use crc32fast::Hasher as Crc32;
use std::io::Read;

// --- Public API ---

/// Encodes one chunk.
///
/// Layout: `count(var_u32) ts_len(var_u32) timestamps[ts_len] value_bits[..]`.
/// Timestamps are the first timestamp followed by deltas, all zigzag varints. Values are a
/// Gorilla XOR bit stream whose first value is stored as 64 raw bits.
///
/// An empty sample slice encodes to a chunk with `count = 0`.
pub fn encode_chunk(samples: &[Sample]) -> Result<Vec<u8>, StorageError> {
    let count: u32 = samples
        .len()
        .try_into()
        .map_err(|_| StorageError::InvalidSeries("Too many samples for one chunk".to_string()))?;

    let mut ts_buf = Vec::with_capacity(samples.len() * 2);
    let mut prev: Timestamp = 0;
    for (i, s) in samples.iter().enumerate() {
        let delta = if i == 0 {
            s.timestamp
        } else {
            s.timestamp.wrapping_sub(prev)
        };
        write_var_u64(&mut ts_buf, zigzag_encode(delta));
        prev = s.timestamp;
    }

    let mut value_buf = Vec::with_capacity(samples.len());
    encode_gorilla_xor(samples.iter().map(|s| s.value.to_bits()), &mut value_buf);

    let ts_len: u32 = ts_buf
        .len()
        .try_into()
        .map_err(|_| StorageError::InvalidSeries("Timestamp section too large".to_string()))?;

    let mut out = Vec::with_capacity(10 + ts_buf.len() + value_buf.len());
    write_var_u32(&mut out, count);
    write_var_u32(&mut out, ts_len);
    out.extend_from_slice(&ts_buf);
    out.extend_from_slice(&value_buf);
    Ok(out)
}

/// Location of the two sections of an encoded chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub count: usize,
    pub ts_start: usize,
    pub values_start: usize,
}

/// Parses and bounds-checks the chunk header without decoding any samples.
pub fn parse_chunk_layout(payload: &[u8]) -> Result<ChunkLayout, StorageError> {
    let mut pos = 0usize;
    let count = read_var_u32(payload, &mut pos).map_err(StorageError::MalformedChunk)? as usize;
    let ts_len = read_var_u32(payload, &mut pos).map_err(StorageError::MalformedChunk)? as usize;
    let ts_start = pos;
    let values_start = ts_start
        .checked_add(ts_len)
        .filter(|end| *end <= payload.len())
        .ok_or_else(|| {
            StorageError::MalformedChunk(format!(
                "Timestamp section of {} bytes exceeds chunk of {} bytes",
                ts_len,
                payload.len()
            ))
        })?;
    Ok(ChunkLayout {
        count,
        ts_start,
        values_start,
    })
}

/// Streaming decoder over an encoded chunk. Each `next()` decodes exactly one sample.
///
/// A malformed stream yields a single `Err` and then ends.
#[derive(Debug)]
pub struct ChunkDecoder<'a> {
    remaining: usize,
    first: bool,
    ts: &'a [u8],
    ts_pos: usize,
    bits: BitReader<'a>,
    prev_ts: Timestamp,
    prev_bits: u64,
    prev_leading: u8,
    prev_trailing: u8,
    prev_sigbits: u8,
    failed: bool,
}

impl<'a> ChunkDecoder<'a> {
    pub fn new(payload: &'a [u8], layout: ChunkLayout) -> Self {
        Self {
            remaining: layout.count,
            first: true,
            ts: &payload[layout.ts_start..layout.values_start],
            ts_pos: 0,
            bits: BitReader::new(&payload[layout.values_start..]),
            prev_ts: 0,
            prev_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
            prev_sigbits: 0,
            failed: false,
        }
    }

    fn decode_next(&mut self) -> Result<Sample, StorageError> {
        let raw = read_var_u64(self.ts, &mut self.ts_pos).map_err(StorageError::MalformedChunk)?;
        let delta = zigzag_decode(raw);

        if self.first {
            self.first = false;
            self.prev_ts = delta;
            self.prev_bits = self.bits.read_bits(64)?;
            return Ok(Sample::new(self.prev_ts, f64::from_bits(self.prev_bits)));
        }

        self.prev_ts = self.prev_ts.wrapping_add(delta);
        self.prev_bits = self.next_value_bits()?;
        Ok(Sample::new(self.prev_ts, f64::from_bits(self.prev_bits)))
    }

    fn next_value_bits(&mut self) -> Result<u64, StorageError> {
        if !self.bits.read_bit()? {
            return Ok(self.prev_bits);
        }
        let (sigbits, trailing) = if !self.bits.read_bit()? {
            if self.prev_sigbits == 0 {
                return Err(StorageError::MalformedChunk(
                    "Gorilla reuse window before initialization".to_string(),
                ));
            }
            (self.prev_sigbits, self.prev_trailing)
        } else {
            let leading = self.bits.read_bits(6)? as u8;
            let sigbits = (self.bits.read_bits(6)? as u8).saturating_add(1);
            if u32::from(leading) + u32::from(sigbits) > 64 {
                return Err(StorageError::MalformedChunk(
                    "Invalid Gorilla bit widths".to_string(),
                ));
            }
            let trailing = 64 - leading - sigbits;
            self.prev_leading = leading;
            self.prev_trailing = trailing;
            self.prev_sigbits = sigbits;
            (sigbits, trailing)
        };
        let significant = self.bits.read_bits(sigbits)?;
        Ok(self.prev_bits ^ (significant << trailing))
    }
}

impl Iterator for ChunkDecoder<'_> {
    type Item = Result<Sample, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        match self.decode_next() {
            Ok(sample) => {
                self.remaining -= 1;
                Some(Ok(sample))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            (0, Some(0))
        } else {
            (0, Some(self.remaining))
        }
    }
}

// --- Helpers (binary, varint, zigzag, bit streams, gorilla) ---

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32, StorageError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}
pub fn read_u64<R: Read>(r: &mut R) -> Result<u64, StorageError> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

#[inline]
fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn write_var_u32(buf: &mut Vec<u8>, v: u32) {
    write_var_u64(buf, v as u64);
}

fn read_var_u64(buf: &[u8], pos: &mut usize) -> Result<u64, String> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..10 {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| format!("Truncated varint at byte {}", *pos))?;
        *pos += 1;
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(out);
        }
        shift += 7;
    }
    Err("Varint too long".to_string())
}

fn read_var_u32(buf: &[u8], pos: &mut usize) -> Result<u32, String> {
    let v = read_var_u64(buf, pos)?;
    u32::try_from(v).map_err(|_| "Varint does not fit in u32".to_string())
}

struct BitWriter<'a> {
    out: &'a mut Vec<u8>,
    cur: u8,
    used: u8,
}

impl<'a> BitWriter<'a> {
    fn new(out: &'a mut Vec<u8>) -> Self {
        Self {
            out,
            cur: 0,
            used: 0,
        }
    }

    fn push_bit(&mut self, bit: bool) {
        let b = if bit { 1u8 } else { 0u8 };
        self.cur |= b << (7 - self.used);
        self.used += 1;
        if self.used == 8 {
            self.out.push(self.cur);
            self.cur = 0;
            self.used = 0;
        }
    }

    fn push_bits(&mut self, mut v: u64, count: u8) {
        if count == 0 {
            return;
        }
        if count < 64 {
            v &= (1u64 << count) - 1;
        }
        for i in (0..count).rev() {
            self.push_bit(((v >> i) & 1) == 1);
        }
    }

    fn finish(self) {
        if self.used > 0 {
            self.out.push(self.cur);
        }
    }
}

#[derive(Debug)]
struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<bool, StorageError> {
        let byte = self.bytes.get(self.pos / 8).ok_or_else(|| {
            StorageError::MalformedChunk(format!("Value bit stream truncated at bit {}", self.pos))
        })?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1 == 1;
        self.pos += 1;
        Ok(bit)
    }

    fn read_bits(&mut self, count: u8) -> Result<u64, StorageError> {
        let mut out = 0u64;
        for _ in 0..count {
            out = (out << 1) | u64::from(self.read_bit()?);
        }
        Ok(out)
    }
}

fn encode_gorilla_xor(mut values: impl Iterator<Item = u64>, out: &mut Vec<u8>) {
    let Some(first) = values.next() else {
        return;
    };
    let mut bw = BitWriter::new(out);
    bw.push_bits(first, 64);

    let mut prev = first;
    let mut prev_leading: u8 = 0;
    let mut prev_trailing: u8 = 0;
    let mut prev_sigbits: u8 = 0;

    for cur in values {
        let x = prev ^ cur;
        if x == 0 {
            bw.push_bit(false);
        } else {
            bw.push_bit(true);
            // Leading zeros are stored in 6 bits.
            let leading = (x.leading_zeros() as u8).min(63);
            let trailing = x.trailing_zeros() as u8;
            let sigbits = 64 - leading - trailing;

            if prev_sigbits != 0 && leading >= prev_leading && trailing >= prev_trailing {
                bw.push_bit(false);
                bw.push_bits(x >> prev_trailing, prev_sigbits);
            } else {
                bw.push_bit(true);
                bw.push_bits(leading as u64, 6);
                bw.push_bits((sigbits - 1) as u64, 6);
                bw.push_bits(x >> trailing, sigbits);
                prev_leading = leading;
                prev_trailing = trailing;
                prev_sigbits = sigbits;
            }
        }
        prev = cur;
    }
    bw.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(payload: &[u8]) -> Result<Vec<Sample>, StorageError> {
        let layout = parse_chunk_layout(payload)?;
        ChunkDecoder::new(payload, layout).collect()
    }

    fn same_bits(a: &[Sample], b: &[Sample]) -> bool {
        a.len() == b.len()
            && a.iter().zip(b).all(|(x, y)| {
                x.timestamp == y.timestamp && x.value.to_bits() == y.value.to_bits()
            })
    }

    #[test]
    fn preserves_special_floats_bit_exact() {
        let samples = vec![
            Sample::new(100, 1.0),
            Sample::new(200, f64::NAN),
            Sample::new(300, f64::INFINITY),
            Sample::new(400, f64::NEG_INFINITY),
            Sample::new(500, -0.0),
            Sample::new(500, 1.5e-300),
        ];
        let enc = encode_chunk(&samples).unwrap();
        assert!(same_bits(&decode_all(&enc).unwrap(), &samples));
    }

    #[test]
    fn handles_negative_and_extreme_timestamps() {
        let samples = vec![
            Sample::new(i64::MIN, 0.0),
            Sample::new(-1, 2.0),
            Sample::new(0, 2.0),
            Sample::new(i64::MAX, 3.0),
        ];
        let enc = encode_chunk(&samples).unwrap();
        assert!(same_bits(&decode_all(&enc).unwrap(), &samples));
    }

    #[test]
    fn repeated_values_compress_to_single_bits() {
        let samples: Vec<Sample> = (0..1000).map(|i| Sample::new(i * 15_000, 42.0)).collect();
        let enc = encode_chunk(&samples).unwrap();
        // 64-bit first value + ~1 bit per repeat, plus ~3 bytes of timestamp varint per sample.
        assert!(enc.len() < 1000 * 4, "encoded size {}", enc.len());
        assert!(same_bits(&decode_all(&enc).unwrap(), &samples));
    }

    #[test]
    fn empty_chunk_yields_nothing() {
        let enc = encode_chunk(&[]).unwrap();
        assert_eq!(decode_all(&enc).unwrap(), Vec::<Sample>::new());
    }

    #[test]
    fn truncated_value_stream_errors_once_then_ends() {
        let samples: Vec<Sample> = (0..10).map(|i| Sample::new(i, i as f64 * 1.1)).collect();
        let mut enc = encode_chunk(&samples).unwrap();
        enc.truncate(enc.len() - 6);
        let layout = parse_chunk_layout(&enc).unwrap();
        let mut dec = ChunkDecoder::new(&enc, layout);
        let mut ok = 0;
        let mut errs = 0;
        for item in dec.by_ref() {
            match item {
                Ok(_) => ok += 1,
                Err(StorageError::MalformedChunk(_)) => errs += 1,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert!(ok < 10);
        assert_eq!(errs, 1);
        assert!(dec.next().is_none());
    }

    #[test]
    fn layout_rejects_oversized_timestamp_section() {
        let mut buf = Vec::new();
        write_var_u32(&mut buf, 3);
        write_var_u32(&mut buf, 500);
        buf.extend_from_slice(&[0u8; 4]);
        assert!(matches!(
            parse_chunk_layout(&buf),
            Err(StorageError::MalformedChunk(_))
        ));
    }

    #[test]
    fn zigzag_is_symmetric() {
        for v in [0i64, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            assert_eq!(zigzag_decode(zigzag_encode(v)), v);
        }
    }
}
