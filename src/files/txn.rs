use std::sync::Arc;

use crate::node::NodeState;
use crate::wal::{KeyGuard, Resolution, TransactionId, WalError, WalService};

/// An open WAL transaction together with the per-file lock it runs under.
///
/// If the owning future is dropped before the transaction is settled, the rollback is
/// spawned onto the runtime and the lock is held until it finishes.
pub(crate) struct OpenTxn {
    wal: Arc<WalService>,
    id: TransactionId,
    guard: Option<KeyGuard>,
    settled: bool,
    /// Bytes to release if a cancelled removal turns out to have completed
    removal: Option<(Arc<NodeState>, u64)>,
}

impl OpenTxn {
    pub(crate) fn new(wal: Arc<WalService>, id: TransactionId, guard: KeyGuard) -> Self {
        Self {
            wal,
            id,
            guard: Some(guard),
            settled: false,
            removal: None,
        }
    }

    /// Mark this transaction as removing a file of `size_bytes`.
    pub(crate) fn removing(mut self, node: Arc<NodeState>, size_bytes: u64) -> Self {
        self.removal = Some((node, size_bytes));
        self
    }

    pub(crate) async fn commit(&mut self) -> Result<(), WalError> {
        self.wal.commit(self.id).await?;
        self.settled = true;
        Ok(())
    }

    pub(crate) async fn rollback(&mut self) -> Result<Resolution, WalError> {
        // A failed rollback stays pending in the log for startup recovery
        self.settled = true;
        self.wal.rollback(self.id).await
    }
}

impl Drop for OpenTxn {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(transaction_id = self.id, "Abandoned transaction left for recovery");
            return;
        };

        let wal = Arc::clone(&self.wal);
        let id = self.id;
        let guard = self.guard.take();
        let removal = self.removal.take();
        tracing::info!(transaction_id = id, "Operation cancelled, rolling back");
        runtime.spawn(async move {
            let _guard = guard;
            match wal.rollback(id).await {
                Ok(Resolution::RolledForward) => {
                    if let Some((node, size_bytes)) = removal {
                        node.record_removed(size_bytes);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(transaction_id = id, error = %e, "Rollback after cancellation failed")
                }
            }
        });
    }
}
