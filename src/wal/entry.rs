use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::models::FileRecord;

/// Monotonically increasing; ordering by id is temporal ordering.
pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalOperation {
    Create,
    Update,
    Delete,
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalStatus {
    Pending,
    Committed,
    RolledBack,
}

/// What recovery needs to redo or undo an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalPayload {
    Create { storage_path: String },
    Update { previous: FileRecord },
    Delete { record: FileRecord },
    Transfer { record: FileRecord, target_node: String },
}

impl WalPayload {
    pub fn operation(&self) -> WalOperation {
        match self {
            WalPayload::Create { .. } => WalOperation::Create,
            WalPayload::Update { .. } => WalOperation::Update,
            WalPayload::Delete { .. } => WalOperation::Delete,
            WalPayload::Transfer { .. } => WalOperation::Transfer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub transaction_id: TransactionId,
    pub operation: WalOperation,
    pub target_file_id: String,
    pub payload: WalPayload,
    pub status: WalStatus,
    pub created_at: DateTime<Utc>,
}

impl WalEntry {
    pub fn is_pending(&self) -> bool {
        self.status == WalStatus::Pending
    }
}

/// One frame in the on-disk log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    Begin(WalEntry),
    Status {
        transaction_id: TransactionId,
        status: WalStatus,
        at: DateTime<Utc>,
    },
    /// Written at the head of a compacted log so ids keep increasing across compactions.
    /// `outcomes` holds the final status of recently compacted transactions.
    Checkpoint {
        next_transaction_id: TransactionId,
        #[serde(default)]
        outcomes: Vec<(TransactionId, WalStatus)>,
    },
}
