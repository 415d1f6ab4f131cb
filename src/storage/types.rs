//! Key/value element traits and tier identifiers shared by every tier.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::hash::Hash;

/// Fixed-width signed integer feature id.
pub trait EmbeddingKey:
    Copy + Eq + Ord + Hash + Debug + Send + Sync + 'static
{
    /// Widen to the on-disk key representation.
    fn to_i64(self) -> i64;

    /// Narrow from the on-disk key representation.
    fn from_i64(value: i64) -> Self;
}

impl EmbeddingKey for i64 {
    #[inline]
    fn to_i64(self) -> i64 {
        self
    }

    #[inline]
    fn from_i64(value: i64) -> Self {
        value
    }
}

impl EmbeddingKey for i32 {
    #[inline]
    fn to_i64(self) -> i64 {
        self as i64
    }

    #[inline]
    fn from_i64(value: i64) -> Self {
        value as i32
    }
}

/// Numeric element of an embedding vector.
pub trait EmbeddingValue:
    Copy + Default + PartialEq + Debug + Send + Sync + 'static
{
    /// Encoded width in bytes
    const BYTES: usize;

    fn put_le<B: BufMut>(self, buf: &mut B);

    fn get_le<B: Buf>(buf: &mut B) -> Self;

    fn to_f64(self) -> f64;

    fn from_f64(value: f64) -> Self;
}

impl EmbeddingValue for f32 {
    const BYTES: usize = 4;

    #[inline]
    fn put_le<B: BufMut>(self, buf: &mut B) {
        buf.put_f32_le(self);
    }

    #[inline]
    fn get_le<B: Buf>(buf: &mut B) -> Self {
        buf.get_f32_le()
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl EmbeddingValue for f64 {
    const BYTES: usize = 8;

    #[inline]
    fn put_le<B: BufMut>(self, buf: &mut B) {
        buf.put_f64_le(self);
    }

    #[inline]
    fn get_le<B: Buf>(buf: &mut B) -> Self {
        buf.get_f64_le()
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }
}

/// Storage tier identifier, ordered fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// Device memory (pooled buffers)
    Hbm,
    /// Host memory
    Dram,
    /// Append-only segment log on local disk
    Ssd,
}

impl TierKind {
    /// All tiers in probe order
    pub const ALL: [TierKind; 3] = [TierKind::Hbm, TierKind::Dram, TierKind::Ssd];

    /// Numeric level (0 = fastest)
    pub fn level(&self) -> usize {
        match self {
            TierKind::Hbm => 0,
            TierKind::Dram => 1,
            TierKind::Ssd => 2,
        }
    }

    /// Tier for a numeric level
    pub fn from_level(level: usize) -> Option<Self> {
        match level {
            0 => Some(TierKind::Hbm),
            1 => Some(TierKind::Dram),
            2 => Some(TierKind::Ssd),
            _ => None,
        }
    }

    /// Copy-back action required when a value is found in this tier
    pub fn copyback(&self) -> CopyBack {
        match self {
            TierKind::Hbm => CopyBack::NotCopyback,
            TierKind::Dram => CopyBack::Copyback,
            TierKind::Ssd => CopyBack::CopybackAndDestroy,
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierKind::Hbm => write!(f, "HBM"),
            TierKind::Dram => write!(f, "DRAM"),
            TierKind::Ssd => write!(f, "SSD"),
        }
    }
}

/// What the caller must do with a slot returned by a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyBack {
    /// Already resident in the fastest tier
    NotCopyback,
    /// Resident in DRAM; promote by copying into HBM
    Copyback,
    /// Transient decoded from SSD; promote and drop the transient
    CopybackAndDestroy,
}

impl CopyBack {
    /// Whether a promotion is required
    pub fn needs_copyback(&self) -> bool {
        !matches!(self, CopyBack::NotCopyback)
    }
}

// =============================================================================
// Tests
// =============================================================================
