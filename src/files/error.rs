use thiserror::Error;

use super::transfer::PeerError;
use crate::attributes::AttributeError;
use crate::mode::{NodeMode, Operation};
use crate::object_store::ObjectStoreError;
use crate::storage::DatabaseError;
use crate::wal::{CompensationError, WalError};

#[derive(Debug, Error)]
pub enum FileError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Upload body ended early: {0}")]
    UploadAborted(String),
    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error("Operation '{operation}' is not permitted in {mode} mode")]
    ModeForbidden { mode: NodeMode, operation: Operation },
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Storage full: {0}")]
    StorageFull(String),
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("WAL write failed: {0}")]
    WalWrite(WalError),
    #[error("File {file_id} is inconsistent: {reason}")]
    Consistency { file_id: String, reason: String },
    #[error("Index error: {0}")]
    Index(#[from] DatabaseError),
    #[error("Transfer target failed: {0}")]
    Peer(String),
}

impl FileError {
    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FileError::StorageUnavailable(_) | FileError::WalWrite(_)
        )
    }

    pub(crate) fn consistency(file_id: &str, reason: impl Into<String>) -> Self {
        FileError::Consistency {
            file_id: file_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ObjectStoreError> for FileError {
    fn from(e: ObjectStoreError) -> Self {
        if e.is_out_of_space() {
            FileError::StorageFull(e.to_string())
        } else {
            FileError::StorageUnavailable(e.to_string())
        }
    }
}

impl From<AttributeError> for FileError {
    fn from(e: AttributeError) -> Self {
        match e {
            AttributeError::TooLarge { size, limit } => FileError::Validation(format!(
                "metadata encodes to {size} bytes, limit is {limit}"
            )),
            AttributeError::NotFound(id) => {
                FileError::consistency(&id, "attribute record missing")
            }
            AttributeError::Corrupt { file_id, source } => {
                FileError::consistency(&file_id, format!("attribute record unreadable: {source}"))
            }
            AttributeError::Store(e) => e.into(),
            other => FileError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<CompensationError> for FileError {
    fn from(e: CompensationError) -> Self {
        match e {
            CompensationError::Attribute(e) => e.into(),
            CompensationError::Store(e) => e.into(),
            CompensationError::Index(e) => e.into(),
        }
    }
}

impl From<WalError> for FileError {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Inconsistent {
                file_id, reason, ..
            } => FileError::Consistency { file_id, reason },
            WalError::Compensation { source, .. } => source.into(),
            other => FileError::WalWrite(other),
        }
    }
}

impl From<PeerError> for FileError {
    fn from(e: PeerError) -> Self {
        match e {
            PeerError::Full(body) => FileError::StorageFull(format!("target node is full: {body}")),
            other => FileError::Peer(other.to_string()),
        }
    }
}
