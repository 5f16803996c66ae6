//! Process-wide node state: fixed lifecycle mode, capacity accounting, and the set of file
//! ids taken offline after a failed consistency check.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::mode::NodeMode;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counters {
    used_bytes: u64,
    file_count: u64,
    /// Bytes of uploads that have finished streaming but not yet committed
    reserved_bytes: u64,
}

#[derive(Debug)]
pub struct NodeState {
    node_id: String,
    mode: NodeMode,
    capacity_bytes: u64,
    replication_factor: u32,
    counters: Mutex<Counters>,
    quarantined: RwLock<BTreeMap<String, String>>,
    wal_healthy: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Online,
    Degraded,
}

/// Snapshot reported to the registry.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub mode: NodeMode,
    pub status: HealthStatus,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub file_count: u64,
    pub replication_factor: u32,
    pub quarantined_files: usize,
    pub wal_healthy: bool,
}

/// Space set aside for a finished upload until its transaction commits.
/// Dropping an uncommitted reservation releases the space.
#[derive(Debug)]
pub struct Reservation {
    node: Arc<NodeState>,
    bytes: u64,
    settled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityExceeded {
    pub requested: u64,
    pub available: u64,
}

impl NodeState {
    pub fn new(
        node_id: impl Into<String>,
        mode: NodeMode,
        capacity_bytes: u64,
        replication_factor: u32,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            mode,
            capacity_bytes,
            replication_factor,
            counters: Mutex::new(Counters::default()),
            quarantined: RwLock::new(BTreeMap::new()),
            wal_healthy: AtomicBool::new(true),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.counters.lock().used_bytes
    }

    pub fn file_count(&self) -> u64 {
        self.counters.lock().file_count
    }

    /// Bytes still available to new uploads, net of in-flight reservations.
    pub fn available_bytes(&self) -> u64 {
        let counters = self.counters.lock();
        self.capacity_bytes
            .saturating_sub(counters.used_bytes)
            .saturating_sub(counters.reserved_bytes)
    }

    /// Reserve `bytes` for an upload awaiting commit.
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> Result<Reservation, CapacityExceeded> {
        let mut counters = self.counters.lock();
        let available = self
            .capacity_bytes
            .saturating_sub(counters.used_bytes)
            .saturating_sub(counters.reserved_bytes);
        if bytes > available {
            return Err(CapacityExceeded {
                requested: bytes,
                available,
            });
        }
        counters.reserved_bytes += bytes;
        Ok(Reservation {
            node: Arc::clone(self),
            bytes,
            settled: false,
        })
    }

    /// Account for a committed removal.
    pub fn record_removed(&self, bytes: u64) {
        let mut counters = self.counters.lock();
        counters.used_bytes = counters.used_bytes.saturating_sub(bytes);
        counters.file_count = counters.file_count.saturating_sub(1);
    }

    /// Replace the counters with values recomputed from committed state.
    pub fn reset_usage(&self, used_bytes: u64, file_count: u64) {
        let mut counters = self.counters.lock();
        counters.used_bytes = used_bytes;
        counters.file_count = file_count;
    }

    pub fn quarantine(&self, file_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(file_id, reason = %reason, "File quarantined pending operator intervention");
        self.quarantined.write().insert(file_id.to_string(), reason);
    }

    pub fn is_quarantined(&self, file_id: &str) -> bool {
        self.quarantined.read().contains_key(file_id)
    }

    pub fn quarantined(&self) -> Vec<(String, String)> {
        self.quarantined
            .read()
            .iter()
            .map(|(id, reason)| (id.clone(), reason.clone()))
            .collect()
    }

    pub fn set_wal_healthy(&self, healthy: bool) {
        self.wal_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn status(&self) -> NodeStatus {
        let counters = *self.counters.lock();
        let quarantined_files = self.quarantined.read().len();
        let wal_healthy = self.wal_healthy.load(Ordering::Relaxed);

        let status = if quarantined_files == 0 && wal_healthy {
            HealthStatus::Online
        } else {
            HealthStatus::Degraded
        };

        NodeStatus {
            node_id: self.node_id.clone(),
            mode: self.mode,
            status,
            capacity_bytes: self.capacity_bytes,
            used_bytes: counters.used_bytes,
            file_count: counters.file_count,
            replication_factor: self.replication_factor,
            quarantined_files,
            wal_healthy,
        }
    }
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Turn the reservation into committed usage for one new file.
    pub fn commit(mut self) {
        let mut counters = self.node.counters.lock();
        counters.reserved_bytes = counters.reserved_bytes.saturating_sub(self.bytes);
        counters.used_bytes += self.bytes;
        counters.file_count += 1;
        self.settled = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            let mut counters = self.node.counters.lock();
            counters.reserved_bytes = counters.reserved_bytes.saturating_sub(self.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(capacity: u64) -> Arc<NodeState> {
        Arc::new(NodeState::new("node-1", NodeMode::Edit, capacity, 1))
    }

    #[test]
    fn test_reservation_commit_updates_counters() {
        let node = node(1000);
        let reservation = node.reserve(400).unwrap();
        assert_eq!(node.available_bytes(), 600);
        assert_eq!(node.used_bytes(), 0);

        reservation.commit();
        assert_eq!(node.used_bytes(), 400);
        assert_eq!(node.file_count(), 1);
        assert_eq!(node.available_bytes(), 600);
    }

    #[test]
    fn test_dropped_reservation_releases_space() {
        let node = node(1000);
        {
            let _reservation = node.reserve(900).unwrap();
            assert_eq!(
                node.reserve(200).unwrap_err(),
                CapacityExceeded {
                    requested: 200,
                    available: 100
                }
            );
        }
        assert_eq!(node.available_bytes(), 1000);
        assert_eq!(node.file_count(), 0);
    }

    #[test]
    fn test_status_degrades_on_quarantine() {
        let node = node(1000);
        assert_eq!(node.status().status, HealthStatus::Online);

        node.quarantine("abc", "checksum mismatch");
        let status = node.status();
        assert_eq!(status.status, HealthStatus::Degraded);
        assert_eq!(status.quarantined_files, 1);
        assert!(node.is_quarantined("abc"));
    }

    #[test]
    fn test_record_removed_saturates() {
        let node = node(1000);
        node.reset_usage(10, 1);
        node.record_removed(50);
        assert_eq!(node.used_bytes(), 0);
        assert_eq!(node.file_count(), 0);
    }
}
