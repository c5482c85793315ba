use std::path::PathBuf;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur when working with a dense HNSW index.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Construction-time configuration errors. No index is produced.
    #[error("invalid index options: {reason}")]
    InvalidOptions { reason: String },

    /// Error when vector dimensions don't match the index dimension.
    #[error("vector dimension mismatch, expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Error when trying to add a key that already exists in a single-value index.
    #[error("key {key} already exists")]
    DuplicateKey { key: u64 },

    /// Error when a key is not found.
    #[error("key {key} not found")]
    KeyNotFound { key: u64 },

    /// Error when the store is full and automatic growth is disabled.
    #[error("index is full at capacity {capacity}, reserve more slots before adding")]
    CapacityExceeded { capacity: usize },

    /// Malformed or internally inconsistent persisted state.
    #[error("corrupt index state: {reason}")]
    CorruptState { reason: String },

    /// The handle was released or never initialized.
    #[error("index handle is released or uninitialized")]
    InvalidHandle,

    /// A caller-provided buffer cannot hold the serialized index.
    #[error("buffer too small, need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    /// CBOR serialization errors.
    #[error("CBOR serialization error: {source:?}")]
    Serialization { source: BoxError },

    /// File I/O errors in the file variants of save and load.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl IndexError {
    pub(crate) fn invalid_options(reason: impl Into<String>) -> Self {
        IndexError::InvalidOptions {
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        IndexError::CorruptState {
            reason: reason.into(),
        }
    }
}
