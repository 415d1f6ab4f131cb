//! SSD Payload Compression
//!
//! Optional LZ4 compression of embedding payloads written to SSD segments,
//! with automatic fallback to the raw bytes when compression does not pay.
//!
//! # Example
//!
//! ```
//! use embstore::storage::compression::{CompressionAlgorithm, PayloadCompressor};
//!
//! let compressor = PayloadCompressor::new(CompressionAlgorithm::Lz4, 16);
//! let payload = vec![0u8; 512];
//!
//! let (stored, algorithm) = compressor.encode(&payload);
//! assert_eq!(algorithm, CompressionAlgorithm::Lz4);
//!
//! let restored = compressor.decode(&stored, algorithm, payload.len()).unwrap();
//! assert_eq!(restored.as_ref(), payload.as_slice());
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported payload compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression
    #[default]
    None,
    /// LZ4 - fast compression
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Record flag bits for this algorithm
    pub fn flag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    /// Decode record flag bits
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 block compressor
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn new() -> Self {
        Self { level: 4 }
    }

    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Payload Compressor
// =============================================================================

/// Compresses record payloads according to the SSD tier configuration.
pub struct PayloadCompressor {
    algorithm: CompressionAlgorithm,
    min_bytes: usize,
    lz4: Lz4Compressor,
}

impl PayloadCompressor {
    pub fn new(algorithm: CompressionAlgorithm, min_bytes: usize) -> Self {
        Self {
            algorithm,
            min_bytes,
            lz4: Lz4Compressor::new(),
        }
    }

    /// Configured algorithm
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Encode a payload, returning the stored bytes and the algorithm
    /// actually applied.
    pub fn encode(&self, payload: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if self.algorithm == CompressionAlgorithm::None || payload.len() < self.min_bytes {
            return (Bytes::copy_from_slice(payload), CompressionAlgorithm::None);
        }
        match self.lz4.compress(payload) {
            Ok(compressed) if compressed.len() < payload.len() => {
                (Bytes::from(compressed), CompressionAlgorithm::Lz4)
            }
            Ok(_) => (Bytes::copy_from_slice(payload), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!("Payload compression failed, storing raw: {}", e);
                (Bytes::copy_from_slice(payload), CompressionAlgorithm::None)
            }
        }
    }

    /// Decode stored bytes; the result must be exactly `expected_len` bytes.
    pub fn decode(
        &self,
        stored: &[u8],
        algorithm: CompressionAlgorithm,
        expected_len: usize,
    ) -> Result<Bytes> {
        let raw = match algorithm {
            CompressionAlgorithm::None => Bytes::copy_from_slice(stored),
            CompressionAlgorithm::Lz4 => Bytes::from(self.lz4.decompress(stored)?),
        };
        if raw.len() != expected_len {
            return Err(Error::DecompressionFailed {
                algorithm: algorithm.name().into(),
                reason: format!("expected {} bytes, got {}", expected_len, raw.len()),
            });
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_lz4_shrinks_sparse_payload() {
        let compressor = PayloadCompressor::new(CompressionAlgorithm::Lz4, 64);
        let payload = vec![0u8; 4096];

        let (stored, algorithm) = compressor.encode(&payload);
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);
        assert!(stored.len() < payload.len());

        let restored = compressor.decode(&stored, algorithm, 4096).unwrap();
        assert_eq!(restored.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_small_payload_stored_raw() {
        let compressor = PayloadCompressor::new(CompressionAlgorithm::Lz4, 64);
        let (stored, algorithm) = compressor.encode(&[1, 2, 3]);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_incompressible_payload_stored_raw() {
        let compressor = PayloadCompressor::new(CompressionAlgorithm::Lz4, 0);
        let payload: Vec<u8> = (0..255u8).map(|i| i.wrapping_mul(97) ^ 0x5a).collect();
        let (_, algorithm) = compressor.encode(&payload);
        assert_eq!(algorithm, CompressionAlgorithm::None);
    }

    #[test]
    fn test_decode_length_mismatch() {
        let compressor = PayloadCompressor::new(CompressionAlgorithm::None, 0);
        assert_matches!(
            compressor.decode(&[0u8; 8], CompressionAlgorithm::None, 16),
            Err(Error::DecompressionFailed { .. })
        );
    }

    #[test]
    fn test_flag_roundtrip() {
        for algorithm in [CompressionAlgorithm::None, CompressionAlgorithm::Lz4] {
            assert_eq!(CompressionAlgorithm::from_flag(algorithm.flag()), Some(algorithm));
        }
        assert_eq!(CompressionAlgorithm::from_flag(7), None);
    }

    #[test]
    fn test_corrupt_lz4_rejected() {
        let compressor = PayloadCompressor::new(CompressionAlgorithm::Lz4, 0);
        let result = compressor.decode(&[0xff; 12], CompressionAlgorithm::Lz4, 64);
        assert!(result.is_err());
    }
}
