use serde::Serialize;

use super::{CompensationError, WalEntry, WalError, WalPayload, WalService, WalStatus};
use crate::attributes::{AttributeError, AttributeRecord};

/// How a pending transaction was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Every partial effect was undone
    RolledBack,
    /// The operation turned out to be complete and was finished
    RolledForward,
    /// Storage disagrees with itself; the file is quarantined
    Inconsistent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Intent {
    /// Caller-requested undo of an operation that failed
    Rollback,
    /// Startup replay of an operation interrupted by a crash
    Recover,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryReport {
    pub rolled_back: Vec<String>,
    pub rolled_forward: Vec<String>,
    pub inconsistent: Vec<String>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.inconsistent.is_empty()
    }

    pub fn total(&self) -> usize {
        self.rolled_back.len() + self.rolled_forward.len() + self.inconsistent.len()
    }
}

impl WalService {
    /// Resolve every pending entry left by a previous process, oldest first.
    ///
    /// Files whose state cannot be reconciled are quarantined and recovery moves on, so one
    /// bad file never keeps the node from starting. Only failures of the log itself abort.
    pub async fn recover(&self) -> Result<RecoveryReport, WalError> {
        let mut report = RecoveryReport::default();

        for entry in self.pending().await {
            let _guard = self.lock(&entry.target_file_id).await;
            let file_id = entry.target_file_id.clone();

            let resolution = match self.compensate(&entry, Intent::Recover).await {
                Ok(resolution) => resolution,
                Err(e) => Resolution::Inconsistent(format!("compensation failed: {e}")),
            };

            tracing::info!(
                transaction_id = entry.transaction_id,
                file_id = %file_id,
                operation = ?entry.operation,
                ?resolution,
                "Recovered WAL entry"
            );

            match self.settle(&entry, &resolution).await {
                Ok(()) => match resolution {
                    Resolution::RolledForward => report.rolled_forward.push(file_id),
                    _ => report.rolled_back.push(file_id),
                },
                Err(WalError::Inconsistent { .. }) => report.inconsistent.push(file_id),
                Err(e) => return Err(e),
            }
        }

        if report.total() > 0 {
            tracing::info!(
                rolled_back = report.rolled_back.len(),
                rolled_forward = report.rolled_forward.len(),
                inconsistent = report.inconsistent.len(),
                "WAL recovery complete"
            );
        }
        Ok(report)
    }

    /// Bring blob, sidecar and index back in line for one entry.
    pub(super) async fn compensate(
        &self,
        entry: &WalEntry,
        intent: Intent,
    ) -> Result<Resolution, CompensationError> {
        debug_assert_eq!(entry.status, WalStatus::Pending);
        let file_id = entry.target_file_id.as_str();

        match &entry.payload {
            WalPayload::Create { storage_path } => {
                if intent == Intent::Recover {
                    // The sidecar is written last, so a verified one means the upload finished
                    if let Some(sidecar) = self.verified_sidecar(file_id).await? {
                        self.db.put_file(&sidecar.into_file_record())?;
                        return Ok(Resolution::RolledForward);
                    }
                }
                self.db.delete_file(file_id)?;
                self.attributes.delete(file_id).await?;
                self.store.delete(storage_path).await?;
                Ok(Resolution::RolledBack)
            }

            WalPayload::Update { previous } => match intent {
                Intent::Rollback => {
                    self.attributes
                        .write(file_id, &AttributeRecord::from(previous))
                        .await?;
                    self.db.put_file(previous)?;
                    Ok(Resolution::RolledBack)
                }
                // Either version of the sidecar is a valid end state; the index follows it
                Intent::Recover => match self.verified_sidecar(file_id).await? {
                    Some(sidecar) => {
                        let rolled_back = AttributeRecord::from(previous) == sidecar;
                        self.db.put_file(&sidecar.into_file_record())?;
                        Ok(if rolled_back {
                            Resolution::RolledBack
                        } else {
                            Resolution::RolledForward
                        })
                    }
                    None => Ok(Resolution::Inconsistent(
                        "sidecar unreadable or blob mismatch after interrupted update".into(),
                    )),
                },
            },

            WalPayload::Delete { record } | WalPayload::Transfer { record, .. } => {
                let sidecar = match self.attributes.try_read(file_id).await {
                    Ok(sidecar) => sidecar,
                    Err(AttributeError::Corrupt { .. }) => {
                        return Ok(Resolution::Inconsistent(
                            "sidecar unreadable during interrupted removal".into(),
                        ))
                    }
                    Err(e) => return Err(e.into()),
                };

                match sidecar {
                    // The blob is only removed after the sidecar, so a present sidecar means the
                    // content should still be there
                    Some(sidecar) => {
                        if self.attributes.verify_record(&sidecar).await? {
                            self.db.put_file(&sidecar.into_file_record())?;
                            Ok(Resolution::RolledBack)
                        } else {
                            Ok(Resolution::Inconsistent(
                                "blob missing or mismatched while sidecar remains".into(),
                            ))
                        }
                    }
                    None => {
                        self.db.delete_file(file_id)?;
                        self.store.delete(&record.storage_path).await?;
                        Ok(Resolution::RolledForward)
                    }
                }
            }
        }
    }

    async fn verified_sidecar(
        &self,
        file_id: &str,
    ) -> Result<Option<AttributeRecord>, CompensationError> {
        let sidecar = match self.attributes.try_read(file_id).await {
            Ok(Some(sidecar)) => sidecar,
            Ok(None) | Err(AttributeError::Corrupt { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if self.attributes.verify_record(&sidecar).await? {
            Ok(Some(sidecar))
        } else {
            Ok(None)
        }
    }
}
