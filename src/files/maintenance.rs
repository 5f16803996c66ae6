//! Periodic background work: retention expiry and consistency scanning.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use super::{FileError, FileService};
use crate::mode::{self, Operation};

#[derive(Debug, Default, Clone, Serialize)]
pub struct ScanReport {
    pub checked: usize,
    pub quarantined: Vec<String>,
}

impl FileService {
    /// Expire every file whose retention period has passed as of `now`.
    /// Does nothing on nodes whose mode exempts them from expiry.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<String>, FileError> {
        if !mode::allowed(self.node.mode(), Operation::Expire) {
            return Ok(Vec::new());
        }

        let due: Vec<String> = self
            .db
            .get_all_files()?
            .into_iter()
            .filter(|file| file.is_expired(now))
            .map(|file| file.id)
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            match self.expire(&id).await {
                Ok(_) => expired.push(id),
                // Removed concurrently
                Err(FileError::NotFound(_)) => {}
                Err(e) => tracing::warn!(file_id = %id, error = %e, "Failed to expire file"),
            }
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired files past retention");
        }
        Ok(expired)
    }

    /// Re-verify every committed file against its sidecar and quarantine mismatches.
    pub async fn scan_consistency(&self) -> Result<ScanReport, FileError> {
        let mut report = ScanReport::default();

        for file in self.db.get_all_files()? {
            if self.node.is_quarantined(&file.id) {
                continue;
            }
            let _guard = self.wal.lock(&file.id).await;
            // Re-read under the lock; the file may have changed or gone meanwhile
            let Some(file) = self.db.get_file(&file.id)? else {
                continue;
            };
            report.checked += 1;

            let problem = match self.attributes.try_read(&file.id).await {
                Ok(None) => Some("sidecar missing".to_string()),
                Ok(Some(sidecar)) if sidecar.checksum != file.checksum => {
                    Some("sidecar checksum differs from index".to_string())
                }
                Ok(Some(sidecar)) => match self.attributes.verify_record(&sidecar).await {
                    Ok(true) => None,
                    Ok(false) => Some("blob missing or checksum mismatch".to_string()),
                    Err(e) => {
                        tracing::warn!(file_id = %file.id, error = %e, "Consistency check skipped");
                        None
                    }
                },
                Err(e) => Some(e.to_string()),
            };

            if let Some(reason) = problem {
                self.node.quarantine(&file.id, reason);
                report.quarantined.push(file.id);
            }
        }

        tracing::info!(
            checked = report.checked,
            quarantined = report.quarantined.len(),
            "Consistency scan finished"
        );
        Ok(report)
    }
}

/// Start the retention sweeper and consistency scanner. A `None` interval disables a task.
pub fn spawn_maintenance(
    files: Arc<FileService>,
    retention_interval: Option<Duration>,
    scan_interval: Option<Duration>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    if let Some(period) = retention_interval {
        if mode::allowed(files.node.mode(), Operation::Expire) {
            let files = Arc::clone(&files);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = files.expire_due(Utc::now()).await {
                        tracing::error!(error = %e, "Retention sweep failed");
                    }
                }
            }));
        } else {
            tracing::info!(mode = %files.node.mode(), "Retention sweeper disabled for this mode");
        }
    }

    if let Some(period) = scan_interval {
        let files = Arc::clone(&files);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = files.scan_consistency().await {
                    tracing::error!(error = %e, "Consistency scan failed");
                }
            }
        }));
    }

    handles
}
