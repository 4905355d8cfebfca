//! Error types for blobstore
//!
//! Provides a unified error type for all storage operations.

use thiserror::Error;

use crate::record::RecordId;

/// Result type alias using BlobError
pub type Result<T> = std::result::Result<T, BlobError>;

/// Unified error type for blob storage operations
#[derive(Debug, Error)]
pub enum BlobError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Format Errors
    // -------------------------------------------------------------------------
    /// File header is not ours, or has an unsupported version/status
    #[error("Storage format error: {0}")]
    Format(String),

    /// A record header read back from storage makes no sense
    #[error("Storage corrupted: {0}")]
    Corrupted(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Storage is closed: {0}")]
    Closed(String),

    // -------------------------------------------------------------------------
    // Record Errors
    // -------------------------------------------------------------------------
    #[error("Payload too large: length {length} > max supported {max}")]
    PayloadTooLarge { length: usize, max: usize },

    #[error("Record {0} not found")]
    RecordNotFound(RecordId),

    #[error("Record {0} was deleted")]
    RecordDeleted(RecordId),

    #[error("Record {0} is already deleted")]
    RecordAlreadyDeleted(RecordId),

    #[error("Invalid record id: {0}")]
    InvalidRecordId(RecordId),

    /// Record ids are 32 bit: offsets past the last addressable id can't be used
    #[error("Storage is full: offset {0} is not addressable by a record id")]
    StorageFull(u64),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl BlobError {
    /// True for errors meaning "there is no live record under this id"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BlobError::RecordNotFound(_) | BlobError::RecordDeleted(_) | BlobError::InvalidRecordId(_)
        )
    }

    /// True for failures of the backing file itself: I/O, bad format, corruption
    pub fn is_io_class(&self) -> bool {
        matches!(
            self,
            BlobError::Io(_) | BlobError::Format(_) | BlobError::Corrupted(_)
        )
    }
}
