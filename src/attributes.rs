//! Attribute sidecars: a bounded, self-describing JSON copy of each file's record stored
//! next to its content blob. Sidecars are the durability anchor the metadata index can be
//! rebuilt from.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum;
use crate::object_store::{
    blob_key, collect_stream, once_stream, sidecar_key, ObjectStore, ObjectStoreError,
    SIDECAR_SUFFIX,
};
use crate::storage::models::{FileRecord, SearchVector};

/// Encoded sidecars may not exceed this many bytes.
pub const MAX_ATTRIBUTE_BYTES: usize = 4096;

const ATTRIBUTE_FORMAT: u32 = 1;

#[derive(Debug, Error)]
pub enum AttributeError {
    #[error("Attribute record not found for file {0}")]
    NotFound(String),
    #[error("Attribute record is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("Attribute record for file {file_id} is unreadable: {source}")]
    Corrupt {
        file_id: String,
        source: serde_json::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub format: u32,
    pub id: String,
    pub storage_path: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub original_filename: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub uploader: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl From<&FileRecord> for AttributeRecord {
    fn from(file: &FileRecord) -> Self {
        Self {
            format: ATTRIBUTE_FORMAT,
            id: file.id.clone(),
            storage_path: file.storage_path.clone(),
            checksum: file.checksum.clone(),
            size_bytes: file.size_bytes,
            mime_type: file.mime_type.clone(),
            original_filename: file.original_filename.clone(),
            description: file.description.clone(),
            tags: file.tags.clone(),
            uploader: file.uploader.clone(),
            created_at: file.created_at,
            updated_at: file.updated_at,
            retention_days: file.retention_days,
        }
    }
}

impl AttributeRecord {
    /// Rebuild the full index row, deriving the search vector.
    pub fn into_file_record(self) -> FileRecord {
        let mut file = FileRecord {
            id: self.id,
            storage_path: self.storage_path,
            checksum: self.checksum,
            size_bytes: self.size_bytes,
            mime_type: self.mime_type,
            original_filename: self.original_filename,
            description: self.description,
            tags: self.tags,
            uploader: self.uploader,
            created_at: self.created_at,
            updated_at: self.updated_at,
            retention_days: self.retention_days,
            search_vector: SearchVector::new(),
        };
        file.refresh_search_vector();
        file
    }

    /// Encode, enforcing the size ceiling.
    pub fn encode(&self) -> Result<Vec<u8>, AttributeError> {
        let data = serde_json::to_vec(self)?;
        if data.len() > MAX_ATTRIBUTE_BYTES {
            return Err(AttributeError::TooLarge {
                size: data.len(),
                limit: MAX_ATTRIBUTE_BYTES,
            });
        }
        Ok(data)
    }
}

/// Reads and atomically replaces sidecars through the configured object store.
#[derive(Clone)]
pub struct AttributeManager {
    store: Arc<dyn ObjectStore>,
}

impl AttributeManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Atomically replace the sidecar for `file_id`.
    pub async fn write(&self, file_id: &str, record: &AttributeRecord) -> Result<(), AttributeError> {
        debug_assert_eq!(file_id, record.id, "sidecar written under a foreign id");
        let data = record.encode()?;
        self.store
            .put(&sidecar_key(file_id), once_stream(Bytes::from(data)))
            .await?;
        Ok(())
    }

    pub async fn read(&self, file_id: &str) -> Result<AttributeRecord, AttributeError> {
        self.try_read(file_id)
            .await?
            .ok_or_else(|| AttributeError::NotFound(file_id.to_string()))
    }

    pub async fn try_read(&self, file_id: &str) -> Result<Option<AttributeRecord>, AttributeError> {
        let stream = match self.store.get(&sidecar_key(file_id)).await {
            Ok(stream) => stream,
            Err(ObjectStoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let data = collect_stream(stream).await?;
        let record = serde_json::from_slice(&data).map_err(|source| AttributeError::Corrupt {
            file_id: file_id.to_string(),
            source,
        })?;
        Ok(Some(record))
    }

    /// Remove the sidecar. Missing sidecars are not an error.
    pub async fn delete(&self, file_id: &str) -> Result<(), AttributeError> {
        self.store.delete(&sidecar_key(file_id)).await?;
        Ok(())
    }

    /// Recompute the blob checksum and compare it with the sidecar.
    /// A missing blob verifies as `false`; a missing sidecar is `NotFound`.
    pub async fn verify(&self, file_id: &str) -> Result<bool, AttributeError> {
        let record = self.read(file_id).await?;
        self.verify_record(&record).await
    }

    /// Verify the blob against an already loaded sidecar.
    pub async fn verify_record(&self, record: &AttributeRecord) -> Result<bool, AttributeError> {
        let stream = match self.store.get(&blob_key(&record.id)).await {
            Ok(stream) => stream,
            Err(ObjectStoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let digest = checksum::digest_stream(stream).await?;
        let consistent =
            digest.checksum == record.checksum && digest.size_bytes == record.size_bytes;
        if !consistent {
            tracing::warn!(
                file_id = %record.id,
                expected = %record.checksum,
                actual = %digest.checksum,
                "Blob does not match its attribute record"
            );
        }
        Ok(consistent)
    }

    /// Ids of every file that has a sidecar.
    pub async fn list_file_ids(&self) -> Result<Vec<String>, AttributeError> {
        let keys = self.store.list("").await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_suffix(SIDECAR_SUFFIX))
            .filter_map(|stem| stem.rsplit('/').next())
            .map(str::to_string)
            .collect())
    }
}
