//! Write-ahead log for multi-step file mutations.
//!
//! Every create, update, delete and transfer writes a `Pending` entry before touching the
//! blob, sidecar or index, and resolves it with a `Committed` or `RolledBack` status record
//! afterwards. Entries left pending by a crash are resolved by [`WalService::recover`]
//! before the node accepts traffic.

mod entry;
mod locks;
mod log;
mod recovery;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::attributes::{AttributeError, AttributeManager};
use crate::node::NodeState;
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::storage::{Database, DatabaseError};

pub use entry::{TransactionId, WalEntry, WalOperation, WalPayload, WalRecord, WalStatus};
pub use locks::{KeyGuard, KeyLocks};
pub use log::WalLog;
pub use recovery::{RecoveryReport, Resolution};

pub const WAL_FILE_NAME: &str = "wal.log";

/// Compacted transactions whose outcome is still remembered.
const OUTCOME_HISTORY: usize = 4096;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("Failed to open WAL: {0}")]
    Open(std::io::Error),
    #[error("WAL write failed: {0}")]
    Write(std::io::Error),
    #[error("WAL device is out of space")]
    LogFull,
    #[error("WAL corrupt at byte {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
    #[error("Unknown transaction {0}")]
    UnknownTransaction(TransactionId),
    #[error("Transaction {0} was compacted and its outcome is no longer known")]
    Compacted(TransactionId),
    #[error("Transaction {id} is already {status:?}")]
    InvalidTransition {
        id: TransactionId,
        status: WalStatus,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("Compensation for transaction {id} failed: {source}")]
    Compensation {
        id: TransactionId,
        source: CompensationError,
    },
    #[error("Transaction {id} left file {file_id} inconsistent: {reason}")]
    Inconsistent {
        id: TransactionId,
        file_id: String,
        reason: String,
    },
}

impl WalError {
    pub(crate) fn from_write(e: std::io::Error) -> Self {
        if e.raw_os_error() == Some(crate::object_store::ENOSPC) {
            WalError::LogFull
        } else {
            WalError::Write(e)
        }
    }

    /// Whether the failure came from the log device rather than the entry itself.
    pub fn is_write_failure(&self) -> bool {
        matches!(self, WalError::Write(_) | WalError::LogFull)
    }
}

/// A compensating action failed part way; the entry stays pending.
#[derive(Debug, Error)]
pub enum CompensationError {
    #[error(transparent)]
    Attribute(#[from] AttributeError),
    #[error(transparent)]
    Store(#[from] ObjectStoreError),
    #[error(transparent)]
    Index(#[from] DatabaseError),
}

struct LogState {
    log: WalLog,
    entries: BTreeMap<TransactionId, WalEntry>,
    next_id: TransactionId,
    /// Resolved entries still present in the log file
    resolved: usize,
    /// Final status of transactions dropped by compaction, oldest evicted first
    outcomes: BTreeMap<TransactionId, WalStatus>,
}

impl LogState {
    /// Status of a transaction that is no longer held as an entry.
    fn settled(&self, id: TransactionId) -> Result<WalStatus, WalError> {
        if id >= self.next_id {
            return Err(WalError::UnknownTransaction(id));
        }
        self.outcomes
            .get(&id)
            .copied()
            .ok_or(WalError::Compacted(id))
    }
}

pub struct WalService {
    state: Mutex<LogState>,
    locks: KeyLocks,
    store: Arc<dyn ObjectStore>,
    attributes: AttributeManager,
    db: Database,
    node: Arc<NodeState>,
    compact_threshold: usize,
}

impl WalService {
    /// Open the log under `data_dir` and replay it into memory.
    /// Pending entries are kept for [`WalService::recover`].
    pub async fn open(
        data_dir: impl AsRef<Path>,
        store: Arc<dyn ObjectStore>,
        attributes: AttributeManager,
        db: Database,
        node: Arc<NodeState>,
        compact_threshold: usize,
    ) -> Result<Self, WalError> {
        let path = data_dir.as_ref().join(WAL_FILE_NAME);
        let (log, records) = WalLog::open(&path).await?;

        let mut entries = BTreeMap::new();
        let mut outcomes = BTreeMap::new();
        let mut next_id: TransactionId = 1;
        for record in records {
            match record {
                WalRecord::Begin(entry) => {
                    next_id = next_id.max(entry.transaction_id + 1);
                    entries.insert(entry.transaction_id, entry);
                }
                WalRecord::Status {
                    transaction_id,
                    status,
                    ..
                } => match entries.get_mut(&transaction_id) {
                    Some(entry) => entry.status = status,
                    None => tracing::warn!(transaction_id, "WAL status for unknown transaction"),
                },
                WalRecord::Checkpoint {
                    next_transaction_id,
                    outcomes: compacted,
                } => {
                    next_id = next_id.max(next_transaction_id);
                    outcomes.extend(compacted);
                }
            }
        }

        let resolved = entries.values().filter(|e| !e.is_pending()).count();
        tracing::info!(
            path = %path.display(),
            entries = entries.len(),
            pending = entries.len() - resolved,
            next_id,
            "WAL opened"
        );

        Ok(Self {
            state: Mutex::new(LogState {
                log,
                entries,
                next_id,
                resolved,
                outcomes,
            }),
            locks: KeyLocks::new(),
            store,
            attributes,
            db,
            node,
            compact_threshold: compact_threshold.max(1),
        })
    }

    /// Take the per-file lock every WAL-protected operation must hold.
    pub async fn lock(&self, file_id: &str) -> KeyGuard {
        self.locks.lock(file_id).await
    }

    /// Durably record the start of an operation on the file `guard` holds.
    /// Returns only after the entry is on stable storage.
    pub async fn begin(
        &self,
        guard: &KeyGuard,
        payload: WalPayload,
    ) -> Result<TransactionId, WalError> {
        let mut state = self.state.lock().await;
        let transaction_id = state.next_id;
        let entry = WalEntry {
            transaction_id,
            operation: payload.operation(),
            target_file_id: guard.key().to_string(),
            payload,
            status: WalStatus::Pending,
            created_at: Utc::now(),
        };

        let appended = state.log.append(&WalRecord::Begin(entry.clone())).await;
        self.track_health(&appended);
        appended?;

        state.next_id += 1;
        state.entries.insert(transaction_id, entry);
        tracing::debug!(
            transaction_id,
            file_id = guard.key(),
            operation = ?state.entries[&transaction_id].operation,
            "WAL begin"
        );
        Ok(transaction_id)
    }

    /// Mark a transaction committed. Repeating a commit is a no-op.
    pub async fn commit(&self, id: TransactionId) -> Result<(), WalError> {
        self.resolve_status(id, WalStatus::Committed).await
    }

    /// Undo whatever part of the transaction reached storage and mark it resolved.
    ///
    /// Compensation may discover that the operation had actually completed, in which case
    /// the entry is finished instead ([`Resolution::RolledForward`]). Rolling back an
    /// already rolled back transaction is a no-op.
    pub async fn rollback(&self, id: TransactionId) -> Result<Resolution, WalError> {
        let entry = {
            let state = self.state.lock().await;
            match state.entries.get(&id) {
                Some(entry) => match entry.status {
                    WalStatus::Pending => entry.clone(),
                    WalStatus::RolledBack => return Ok(Resolution::RolledBack),
                    status => return Err(WalError::InvalidTransition { id, status }),
                },
                None => match state.settled(id)? {
                    WalStatus::RolledBack => return Ok(Resolution::RolledBack),
                    status => return Err(WalError::InvalidTransition { id, status }),
                },
            }
        };

        let resolution = self
            .compensate(&entry, recovery::Intent::Rollback)
            .await
            .map_err(|source| WalError::Compensation { id, source })?;
        self.settle(&entry, &resolution).await?;
        Ok(resolution)
    }

    /// Pending entries in ascending id order.
    pub async fn pending(&self) -> Vec<WalEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|e| e.is_pending())
            .cloned()
            .collect()
    }

    pub async fn entry(&self, id: TransactionId) -> Option<WalEntry> {
        self.state.lock().await.entries.get(&id).cloned()
    }

    /// Record the outcome of a compensation.
    async fn settle(&self, entry: &WalEntry, resolution: &Resolution) -> Result<(), WalError> {
        let id = entry.transaction_id;
        match resolution {
            Resolution::RolledBack => self.resolve_status(id, WalStatus::RolledBack).await,
            Resolution::RolledForward => self.resolve_status(id, WalStatus::Committed).await,
            Resolution::Inconsistent(reason) => {
                self.node.quarantine(&entry.target_file_id, reason.clone());
                Err(WalError::Inconsistent {
                    id,
                    file_id: entry.target_file_id.clone(),
                    reason: reason.clone(),
                })
            }
        }
    }

    async fn resolve_status(&self, id: TransactionId, status: WalStatus) -> Result<(), WalError> {
        let mut state = self.state.lock().await;
        match state.entries.get(&id) {
            Some(entry) if entry.status == status => return Ok(()),
            Some(entry) if entry.status != WalStatus::Pending => {
                return Err(WalError::InvalidTransition {
                    id,
                    status: entry.status,
                })
            }
            Some(_) => {}
            None => {
                let settled = state.settled(id)?;
                if settled == status {
                    return Ok(());
                }
                return Err(WalError::InvalidTransition {
                    id,
                    status: settled,
                });
            }
        }

        let appended = state
            .log
            .append(&WalRecord::Status {
                transaction_id: id,
                status,
                at: Utc::now(),
            })
            .await;
        self.track_health(&appended);
        appended?;

        if let Some(entry) = state.entries.get_mut(&id) {
            entry.status = status;
        }
        state.resolved += 1;
        tracing::debug!(transaction_id = id, ?status, "WAL resolved");

        if state.resolved >= self.compact_threshold {
            // A failed compaction leaves the previous log in place
            if let Err(e) = Self::compact(&mut state).await {
                tracing::warn!(error = %e, "WAL compaction failed");
            }
        }
        Ok(())
    }

    /// Drop resolved entries from the log, keeping pending ones, the id high-water mark
    /// and the most recent outcomes.
    async fn compact(state: &mut LogState) -> Result<(), WalError> {
        let mut outcomes = state.outcomes.clone();
        outcomes.extend(
            state
                .entries
                .values()
                .filter(|e| !e.is_pending())
                .map(|e| (e.transaction_id, e.status)),
        );
        while outcomes.len() > OUTCOME_HISTORY {
            outcomes.pop_first();
        }

        let mut records = vec![WalRecord::Checkpoint {
            next_transaction_id: state.next_id,
            outcomes: outcomes.iter().map(|(&id, &status)| (id, status)).collect(),
        }];
        records.extend(
            state
                .entries
                .values()
                .filter(|e| e.is_pending())
                .cloned()
                .map(WalRecord::Begin),
        );

        state.log.rewrite(&records).await?;
        state.outcomes = outcomes;
        let before = state.entries.len();
        state.entries.retain(|_, e| e.is_pending());
        tracing::info!(
            removed = before - state.entries.len(),
            remaining = state.entries.len(),
            "WAL compacted"
        );
        state.resolved = 0;
        Ok(())
    }

    fn track_health<T>(&self, result: &Result<T, WalError>) {
        match result {
            Ok(_) => self.node.set_wal_healthy(true),
            Err(e) if e.is_write_failure() => {
                tracing::error!(error = %e, "WAL append failed");
                self.node.set_wal_healthy(false);
            }
            Err(_) => {}
        }
    }
}
