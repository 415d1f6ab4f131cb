//! On-disk record codec.
//!
//! ```text
//! 0        4     5       8      16        24     32          40           44        48
//! ┌────────┬─────┬───────┬──────┬─────────┬──────┬───────────┬────────────┬─────────┬─────────┬──────────┐
//! │ magic  │flags│ rsvd  │ key  │ version │ freq │init_flags │ stored_len │ raw_len │ payload │ checksum │
//! └────────┴─────┴───────┴──────┴─────────┴──────┴───────────┴────────────┴─────────┴─────────┴──────────┘
//! ```
//!
//! All integers little-endian. The checksum is XxHash64 (seed 0) over the
//! header and payload.

use bytes::{Buf, BufMut, BytesMut};
use std::hash::Hasher;
use twox_hash::XxHash64;

use crate::storage::compression::{CompressionAlgorithm, PayloadCompressor};
use crate::storage::slot::{SlotHeader, ValueSlot};
use crate::storage::types::EmbeddingValue;

/// "EMB1"
pub const RECORD_MAGIC: u32 = 0x3142_4D45;

/// Fixed header length
pub const HEADER_LEN: usize = 48;

/// Trailing checksum length
pub const CHECKSUM_LEN: usize = 8;

/// XxHash64 of `data`
pub fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// Parsed fixed-size record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: i64,
    pub slot: SlotHeader,
    pub algorithm: CompressionAlgorithm,
    pub stored_len: usize,
    pub raw_len: usize,
}

impl RecordHeader {
    /// Total on-disk length of the record this header starts
    pub fn record_len(&self) -> usize {
        HEADER_LEN + self.stored_len + CHECKSUM_LEN
    }

    /// Parse and sanity-check a header
    pub fn parse(mut buf: &[u8]) -> std::result::Result<Self, String> {
        if buf.len() < HEADER_LEN {
            return Err(format!("truncated header: {} bytes", buf.len()));
        }
        let magic = buf.get_u32_le();
        if magic != RECORD_MAGIC {
            return Err(format!("bad magic {:#010x}", magic));
        }
        let flags = buf.get_u8();
        let algorithm = CompressionAlgorithm::from_flag(flags)
            .ok_or_else(|| format!("unknown flags {:#04x}", flags))?;
        buf.advance(3);
        let key = buf.get_i64_le();
        let version = buf.get_i64_le();
        let freq = buf.get_u64_le();
        let init_flags = buf.get_u64_le();
        let stored_len = buf.get_u32_le() as usize;
        let raw_len = buf.get_u32_le() as usize;
        Ok(Self {
            key,
            slot: SlotHeader {
                freq,
                version,
                init_flags,
            },
            algorithm,
            stored_len,
            raw_len,
        })
    }
}

/// A fully decoded record
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord<V> {
    pub header: RecordHeader,
    pub values: Vec<V>,
}

impl<V: EmbeddingValue> DecodedRecord<V> {
    /// Materialize a transient slot of `total_dims` elements
    pub fn into_slot(self, total_dims: usize) -> ValueSlot<V> {
        let slot = if self.values.is_empty() {
            ValueSlot::new(total_dims)
        } else {
            ValueSlot::with_buffer(self.values.into_boxed_slice())
        };
        slot.set_header(self.header.slot);
        slot
    }
}

/// Serialize `slot` under `key`
pub fn encode<V: EmbeddingValue>(
    key: i64,
    slot: &ValueSlot<V>,
    compressor: &PayloadCompressor,
) -> BytesMut {
    let raw = match slot.read() {
        Some(values) => {
            let mut raw = BytesMut::with_capacity(values.len() * V::BYTES);
            for v in values.iter() {
                v.put_le(&mut raw);
            }
            raw
        }
        None => BytesMut::new(),
    };
    let (stored, algorithm) = compressor.encode(&raw);
    let header = slot.header();

    let mut buf = BytesMut::with_capacity(HEADER_LEN + stored.len() + CHECKSUM_LEN);
    buf.put_u32_le(RECORD_MAGIC);
    buf.put_u8(algorithm.flag());
    buf.put_bytes(0, 3);
    buf.put_i64_le(key);
    buf.put_i64_le(header.version);
    buf.put_u64_le(header.freq);
    buf.put_u64_le(header.init_flags);
    buf.put_u32_le(stored.len() as u32);
    buf.put_u32_le(raw.len() as u32);
    buf.put_slice(&stored);
    let sum = checksum(&buf);
    buf.put_u64_le(sum);
    buf
}

/// Validate and decode one complete record.
///
/// `total_dims` is the expected element count of a non-empty payload.
pub fn decode<V: EmbeddingValue>(
    buf: &[u8],
    compressor: &PayloadCompressor,
    total_dims: usize,
) -> std::result::Result<DecodedRecord<V>, String> {
    let header = RecordHeader::parse(buf)?;
    let len = header.record_len();
    if buf.len() < len {
        return Err(format!(
            "truncated record: {} of {} bytes",
            buf.len(),
            len
        ));
    }
    let body = &buf[..len - CHECKSUM_LEN];
    let stored_sum = (&buf[len - CHECKSUM_LEN..len]).get_u64_le();
    let actual_sum = checksum(body);
    if stored_sum != actual_sum {
        return Err(format!(
            "checksum mismatch: stored {:#018x}, computed {:#018x}",
            stored_sum, actual_sum
        ));
    }
    if header.raw_len != 0 && header.raw_len != total_dims * V::BYTES {
        return Err(format!(
            "payload of {} bytes does not hold {} elements",
            header.raw_len, total_dims
        ));
    }

    let stored = &body[HEADER_LEN..];
    let raw = compressor
        .decode(stored, header.algorithm, header.raw_len)
        .map_err(|e| e.to_string())?;
    let mut reader = raw.as_ref();
    let mut values = Vec::with_capacity(header.raw_len / V::BYTES);
    while reader.remaining() >= V::BYTES {
        values.push(V::get_le(&mut reader));
    }
    Ok(DecodedRecord { header, values })
}

// =============================================================================
// Tests
// =============================================================================
