//! File Service: orchestrates blob, sidecar and index changes inside WAL transactions.
//!
//! Every mutation runs `mode guard -> per-file lock -> WAL begin -> side effects -> commit`.
//! Reads skip the WAL and only ever see committed index rows.

mod error;
mod maintenance;
mod stream;
mod transfer;
mod txn;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::attributes::{AttributeManager, AttributeRecord};
use crate::mode::{self, Operation};
use crate::node::{NodeState, Reservation};
use crate::object_store::{blob_key, ByteRange, ByteStream, ObjectStore};
use crate::storage::models::{FileRecord, FileUpdate, NewFile, SearchVector};
use crate::storage::Database;
use crate::wal::{RecoveryReport, Resolution, WalPayload, WalService};

pub use error::FileError;
pub use maintenance::{spawn_maintenance, ScanReport};
pub use stream::{verified, UploadMeter};
pub use transfer::{HttpPeerClient, PeerClient, PeerError, PeerReceipt};
use txn::OpenTxn;

const MAX_FILENAME_CHARS: usize = 255;
const MAX_TAGS: usize = 64;
const FALLBACK_MIME: &str = "application/octet-stream";

pub struct FileService {
    store: Arc<dyn ObjectStore>,
    attributes: AttributeManager,
    db: Database,
    wal: Arc<WalService>,
    node: Arc<NodeState>,
    peers: Arc<dyn PeerClient>,
    max_upload_size: u64,
}

impl FileService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        db: Database,
        wal: Arc<WalService>,
        node: Arc<NodeState>,
        peers: Arc<dyn PeerClient>,
        max_upload_size: u64,
    ) -> Self {
        Self {
            attributes: AttributeManager::new(Arc::clone(&store)),
            store,
            db,
            wal,
            node,
            peers,
            max_upload_size,
        }
    }

    pub fn node(&self) -> &Arc<NodeState> {
        &self.node
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn wal(&self) -> &Arc<WalService> {
        &self.wal
    }

    /// Bring the node to a consistent state before it serves traffic: resolve pending WAL
    /// entries, rebuild an empty index from sidecars, and recount usage.
    pub async fn recover(&self) -> Result<RecoveryReport, FileError> {
        let report = self.wal.recover().await?;

        if self.db.is_empty()? {
            let rebuilt = self.rebuild_index().await?;
            if rebuilt > 0 {
                tracing::warn!(files = rebuilt, "Metadata index rebuilt from sidecars");
            }
        }

        let (used_bytes, file_count) = self.db.usage()?;
        self.node.reset_usage(used_bytes, file_count);
        tracing::info!(used_bytes, file_count, "Usage recomputed from committed files");
        Ok(report)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Store a new file from `content` and commit its record.
    pub async fn create(
        &self,
        content: ByteStream,
        metadata: NewFile,
        uploader: &str,
    ) -> Result<FileRecord, FileError> {
        self.check_mode(Operation::Create)?;
        let id = Uuid::new_v4().to_string();
        let mut record = self.prepare_record(&id, metadata, uploader, Utc::now())?;

        let guard = self.wal.lock(&id).await;
        let txn_id = self
            .wal
            .begin(
                &guard,
                WalPayload::Create {
                    storage_path: record.storage_path.clone(),
                },
            )
            .await?;
        let mut txn = OpenTxn::new(Arc::clone(&self.wal), txn_id, guard);

        let reservation = match self.write_new(&mut record, content).await {
            Ok(reservation) => reservation,
            Err(e) => {
                self.abort(&mut txn, &id, None).await;
                return Err(e);
            }
        };
        if let Err(e) = txn.commit().await {
            self.abort(&mut txn, &id, None).await;
            return Err(e.into());
        }
        reservation.commit();

        tracing::info!(
            file_id = %id,
            size_bytes = record.size_bytes,
            mime_type = %record.mime_type,
            uploader,
            "Created file"
        );
        Ok(record)
    }

    /// Stream the content in, then persist sidecar and index row.
    async fn write_new(
        &self,
        record: &mut FileRecord,
        content: ByteStream,
    ) -> Result<Reservation, FileError> {
        let available = self.node.available_bytes();
        let limit = self.max_upload_size.min(available);
        let meter = UploadMeter::new(limit);

        let stored = self
            .store
            .put(&record.storage_path, meter.wrap(content))
            .await;
        if meter.exceeded() {
            return Err(if available < self.max_upload_size {
                FileError::StorageFull(format!("{available} bytes available"))
            } else {
                FileError::TooLarge {
                    limit: self.max_upload_size,
                }
            });
        }
        if let Some(reason) = meter.source_error() {
            return Err(FileError::UploadAborted(reason));
        }
        stored?;

        let digest = meter.finish();
        record.checksum = digest.checksum;
        record.size_bytes = digest.size_bytes;

        let reservation = self.node.reserve(record.size_bytes).map_err(|e| {
            FileError::StorageFull(format!(
                "{} bytes requested, {} available",
                e.requested, e.available
            ))
        })?;

        self.attributes
            .write(&record.id, &AttributeRecord::from(&*record))
            .await?;
        self.db.put_file(record)?;
        Ok(reservation)
    }

    /// Apply a metadata change to a committed file.
    pub async fn update(&self, file_id: &str, update: FileUpdate) -> Result<FileRecord, FileError> {
        self.check_mode(Operation::Update)?;
        check_id(file_id)?;
        if let Some(ref name) = update.original_filename {
            validate_filename(name)?;
        }
        if let Some(ref tags) = update.tags {
            validate_tags(tags)?;
        }

        let guard = self.wal.lock(file_id).await;
        let current = self.committed(file_id)?;
        if update.is_empty() {
            return Ok(current);
        }

        let updated = update.applied_to(&current, Utc::now());
        let sidecar = AttributeRecord::from(&updated);
        sidecar.encode()?;

        let txn_id = self
            .wal
            .begin(
                &guard,
                WalPayload::Update {
                    previous: current.clone(),
                },
            )
            .await?;
        let mut txn = OpenTxn::new(Arc::clone(&self.wal), txn_id, guard);

        let applied = async {
            self.attributes.write(file_id, &sidecar).await?;
            self.db.put_file(&updated)?;
            Ok::<_, FileError>(())
        }
        .await;

        if let Err(e) = applied {
            self.abort(&mut txn, file_id, None).await;
            return Err(e);
        }
        if let Err(e) = txn.commit().await {
            self.abort(&mut txn, file_id, None).await;
            return Err(e.into());
        }

        tracing::info!(file_id, "Updated file metadata");
        Ok(updated)
    }

    /// Remove a file on a caller's request.
    pub async fn delete(&self, file_id: &str) -> Result<FileRecord, FileError> {
        self.remove(file_id, Operation::Delete).await
    }

    /// Remove a file whose retention period has passed.
    pub async fn expire(&self, file_id: &str) -> Result<FileRecord, FileError> {
        self.remove(file_id, Operation::Expire).await
    }

    async fn remove(&self, file_id: &str, operation: Operation) -> Result<FileRecord, FileError> {
        self.check_mode(operation)?;
        check_id(file_id)?;

        let guard = self.wal.lock(file_id).await;
        let record = self.committed(file_id)?;

        let txn_id = self
            .wal
            .begin(
                &guard,
                WalPayload::Delete {
                    record: record.clone(),
                },
            )
            .await?;
        let mut txn = OpenTxn::new(Arc::clone(&self.wal), txn_id, guard)
            .removing(Arc::clone(&self.node), record.size_bytes);

        if let Err(e) = self.remove_committed(&record).await {
            self.abort(&mut txn, file_id, Some(record.size_bytes)).await;
            return Err(e);
        }
        if let Err(e) = txn.commit().await {
            self.abort(&mut txn, file_id, Some(record.size_bytes)).await;
            return Err(e.into());
        }
        self.node.record_removed(record.size_bytes);

        tracing::info!(file_id, size_bytes = record.size_bytes, %operation, "Removed file");
        Ok(record)
    }

    /// Index row first, then sidecar, then blob. Recovery relies on this order.
    async fn remove_committed(&self, record: &FileRecord) -> Result<(), FileError> {
        self.db.delete_file(&record.id)?;
        self.attributes.delete(&record.id).await?;
        self.store.delete(&record.storage_path).await?;
        Ok(())
    }

    /// Move a file to `target_node`. The local copy is only removed after the target has
    /// committed a copy with the same checksum.
    pub async fn transfer(
        &self,
        file_id: &str,
        target_node: &str,
        token: Option<&str>,
    ) -> Result<PeerReceipt, FileError> {
        self.check_mode(Operation::Transfer)?;
        check_id(file_id)?;
        let target_node = target_node.trim();
        if !(target_node.starts_with("http://") || target_node.starts_with("https://")) {
            return Err(FileError::Validation(
                "target_node must be an http(s) base URL".into(),
            ));
        }

        let guard = self.wal.lock(file_id).await;
        let record = self.committed(file_id)?;

        let txn_id = self
            .wal
            .begin(
                &guard,
                WalPayload::Transfer {
                    record: record.clone(),
                    target_node: target_node.to_string(),
                },
            )
            .await?;
        let mut txn = OpenTxn::new(Arc::clone(&self.wal), txn_id, guard)
            .removing(Arc::clone(&self.node), record.size_bytes);

        let moved = async {
            let content = self.verified_content(&record).await?;
            let receipt = self.peers.push(target_node, &record, content, token).await?;
            if receipt.checksum != record.checksum || receipt.size_bytes != record.size_bytes {
                tracing::warn!(
                    file_id,
                    target_node,
                    remote_id = %receipt.id,
                    remote_checksum = %receipt.checksum,
                    "Target stored a different checksum, keeping local copy"
                );
                return Err(FileError::Peer(format!(
                    "target confirmed checksum {} ({} bytes), expected {} ({} bytes)",
                    receipt.checksum, receipt.size_bytes, record.checksum, record.size_bytes
                )));
            }
            self.remove_committed(&record).await?;
            Ok::<_, FileError>(receipt)
        }
        .await;

        let receipt = match moved {
            Ok(receipt) => receipt,
            Err(e) => {
                self.abort(&mut txn, file_id, Some(record.size_bytes)).await;
                return Err(e);
            }
        };
        if let Err(e) = txn.commit().await {
            self.abort(&mut txn, file_id, Some(record.size_bytes)).await;
            return Err(e.into());
        }
        self.node.record_removed(record.size_bytes);

        tracing::info!(
            file_id,
            target_node,
            remote_id = %receipt.id,
            "Transferred file"
        );
        Ok(receipt)
    }

    /// Roll back after a failed step. `removed_bytes` is set for removals, whose rollback
    /// may find the removal already complete.
    async fn abort(&self, txn: &mut OpenTxn, file_id: &str, removed_bytes: Option<u64>) {
        match txn.rollback().await {
            Ok(Resolution::RolledForward) => {
                if let Some(bytes) = removed_bytes {
                    self.node.record_removed(bytes);
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(file_id, error = %e, "Rollback failed, entry left for recovery")
            }
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, file_id: &str) -> Result<FileRecord, FileError> {
        self.check_mode(Operation::Read)?;
        check_id(file_id)?;
        self.committed(file_id)
    }

    /// Open the full content, verifying its checksum as it streams.
    pub async fn open(&self, file_id: &str) -> Result<(FileRecord, ByteStream), FileError> {
        let record = self.get(file_id)?;
        let content = self.verified_content(&record).await?;
        Ok((record, content))
    }

    /// Stream the given ranges of a committed file.
    pub async fn open_ranges(
        &self,
        record: &FileRecord,
        ranges: &[ByteRange],
    ) -> Result<ByteStream, FileError> {
        Ok(self.store.get_range(&record.storage_path, ranges).await?)
    }

    async fn verified_content(&self, record: &FileRecord) -> Result<ByteStream, FileError> {
        let content = self.store.get(&record.storage_path).await?;
        Ok(verified(
            content,
            record.id.clone(),
            record.checksum.clone(),
            record.size_bytes,
            Arc::clone(&self.node),
        ))
    }

    /// Committed row for `file_id`, refusing quarantined files.
    fn committed(&self, file_id: &str) -> Result<FileRecord, FileError> {
        if self.node.is_quarantined(file_id) {
            return Err(FileError::consistency(file_id, "file is quarantined"));
        }
        self.db
            .get_file(file_id)?
            .ok_or_else(|| FileError::NotFound(file_id.to_string()))
    }

    fn check_mode(&self, operation: Operation) -> Result<(), FileError> {
        let mode = self.node.mode();
        if mode::allowed(mode, operation) {
            Ok(())
        } else {
            tracing::debug!(%mode, %operation, "Operation rejected by mode guard");
            Err(FileError::ModeForbidden { mode, operation })
        }
    }

    /// Validate caller metadata and build the record that will be committed. Checksum and
    /// size are filled in once the content has been streamed.
    fn prepare_record(
        &self,
        id: &str,
        metadata: NewFile,
        uploader: &str,
        now: DateTime<Utc>,
    ) -> Result<FileRecord, FileError> {
        let filename = metadata.filename.trim().to_string();
        validate_filename(&filename)?;
        validate_tags(&metadata.tags)?;
        if metadata.retention_days == Some(0) {
            return Err(FileError::Validation(
                "retention_days must be at least 1".into(),
            ));
        }
        if uploader.is_empty() {
            return Err(FileError::Validation("uploader must not be empty".into()));
        }

        let mime_type = metadata
            .mime_type
            .filter(|m| !m.is_empty() && m != FALLBACK_MIME)
            .or_else(|| mime_guess::from_path(&filename).first().map(|m| m.to_string()))
            .unwrap_or_else(|| FALLBACK_MIME.to_string());

        let mut record = FileRecord {
            id: id.to_string(),
            storage_path: blob_key(id),
            // Widest values so the size check below holds for the final sidecar
            checksum: "0".repeat(64),
            size_bytes: u64::MAX,
            mime_type,
            original_filename: filename,
            description: metadata.description.filter(|d| !d.trim().is_empty()),
            tags: metadata.tags,
            uploader: uploader.to_string(),
            created_at: now,
            updated_at: now,
            retention_days: metadata.retention_days,
            search_vector: SearchVector::new(),
        };
        AttributeRecord::from(&record).encode()?;
        record.refresh_search_vector();
        Ok(record)
    }

    /// Reinsert every verifiable sidecar into the index. Unverifiable ones are quarantined.
    pub async fn rebuild_index(&self) -> Result<usize, FileError> {
        let ids = self.attributes.list_file_ids().await?;
        let mut rebuilt = 0;

        for id in ids {
            let _guard = self.wal.lock(&id).await;
            let sidecar = match self.attributes.try_read(&id).await {
                Ok(Some(sidecar)) => sidecar,
                Ok(None) => continue,
                Err(e) => {
                    self.node.quarantine(&id, e.to_string());
                    continue;
                }
            };
            if self.attributes.verify_record(&sidecar).await? {
                self.db.put_file(&sidecar.into_file_record())?;
                rebuilt += 1;
            } else {
                self.node
                    .quarantine(&id, "blob missing or mismatched during index rebuild");
            }
        }
        Ok(rebuilt)
    }
}

/// Ids are canonical hyphenated UUIDs; anything else cannot name a stored file.
fn check_id(file_id: &str) -> Result<(), FileError> {
    match Uuid::parse_str(file_id) {
        Ok(uuid) if uuid.hyphenated().to_string() == file_id => Ok(()),
        _ => Err(FileError::NotFound(file_id.to_string())),
    }
}

fn validate_filename(name: &str) -> Result<(), FileError> {
    if name.trim().is_empty() {
        return Err(FileError::Validation("filename must not be empty".into()));
    }
    if name.chars().count() > MAX_FILENAME_CHARS {
        return Err(FileError::Validation(format!(
            "filename exceeds {MAX_FILENAME_CHARS} characters"
        )));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(FileError::Validation(
            "filename must not contain path separators".into(),
        ));
    }
    Ok(())
}

fn validate_tags(tags: &BTreeMap<String, String>) -> Result<(), FileError> {
    if tags.len() > MAX_TAGS {
        return Err(FileError::Validation(format!(
            "at most {MAX_TAGS} tags are allowed"
        )));
    }
    if tags.keys().any(|key| key.trim().is_empty()) {
        return Err(FileError::Validation("tag keys must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_id() {
        assert!(check_id("3f2a9c7e-1111-4222-8333-444455556666").is_ok());
        assert!(matches!(
            check_id("../../etc/passwd"),
            Err(FileError::NotFound(_))
        ));
        assert!(check_id("3F2A9C7E-1111-4222-8333-444455556666").is_err());
        assert!(check_id("3f2a9c7e111142228333444455556666").is_err());
    }

    #[test]
    fn test_filename_rules() {
        assert!(validate_filename("report.pdf").is_ok());
        assert!(validate_filename("  ").is_err());
        assert!(validate_filename("a/b.txt").is_err());
        assert!(validate_filename(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_tag_rules() {
        let ok = BTreeMap::from([("type".to_string(), "invoice".to_string())]);
        assert!(validate_tags(&ok).is_ok());

        let blank = BTreeMap::from([(" ".to_string(), "x".to_string())]);
        assert!(validate_tags(&blank).is_err());

        let many = (0..=MAX_TAGS).map(|i| (format!("k{i}"), "v".to_string())).collect();
        assert!(validate_tags(&many).is_err());
    }
}
