//! Error types for the embedding storage engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the embedding storage engine
#[derive(Error, Debug)]
pub enum Error {
    /// Key is not resident in any tier
    #[error("Key not found: {key}")]
    NotFound { key: i64 },

    /// Lost an insert race; only surfaced by tier-level `try_insert`
    #[error("Key already exists: {key}")]
    AlreadyExists { key: i64 },

    /// Memory pool or disk quota exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// SSD record failed validation
    #[error("Corrupted record in segment {segment} at offset {offset}: {reason}")]
    Corruption {
        segment: u64,
        offset: u64,
        reason: String,
    },

    /// Caller passed inconsistent arguments; nothing was mutated
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Compression failed
    #[error("Compression failed with {algorithm}: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression failed with {algorithm}: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is a plain miss
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this error means another writer won an insert race
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Check if this error is a record validation failure
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption { .. })
    }
}

// =============================================================================
// Tests
// =============================================================================
