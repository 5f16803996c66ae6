//! file-node - A storage backend node for a distributed file platform
//!
//! This crate provides durable file storage with:
//! - Swappable object storage backends (local filesystem, GCS)
//! - A write-ahead log making every mutation all-or-nothing across crashes
//! - Atomic attribute sidecars the metadata index can be rebuilt from
//! - redb embedded database for the metadata index (ACID, MVCC, crash-safe)
//! - Byte-range downloads and ranked metadata search over a REST API
//! - A fixed lifecycle mode (edit, rw, ro, ar) gating every operation

pub mod api;
pub mod attributes;
pub mod auth;
pub mod checksum;
pub mod config;
pub mod files;
pub mod mode;
pub mod node;
pub mod object_store;
pub mod range;
pub mod search;
pub mod storage;
pub mod wal;

use std::sync::Arc;

use thiserror::Error;

use attributes::AttributeManager;
use auth::TokenVerifier;
use config::Config;
use files::{FileError, FileService, PeerClient};
use node::NodeState;
use search::SearchEngine;
use storage::{Database, DatabaseError};
use wal::{RecoveryReport, WalError, WalService};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to open metadata index: {0}")]
    Database(#[from] DatabaseError),
    #[error("Failed to open WAL: {0}")]
    Wal(#[from] WalError),
    #[error("Recovery failed: {0}")]
    Recovery(#[from] FileError),
}

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub files: Arc<FileService>,
    pub node: Arc<NodeState>,
    pub search: SearchEngine,
    pub verifier: TokenVerifier,
}

impl AppState {
    /// Open the index and WAL, run recovery, and assemble the services.
    /// Must finish before the node accepts traffic.
    pub async fn open(
        config: Config,
        store: Arc<dyn object_store::ObjectStore>,
        peers: Arc<dyn PeerClient>,
        verifier: TokenVerifier,
    ) -> Result<(Self, RecoveryReport), StartupError> {
        let db = Database::open(&config.node.data_dir)?;
        let node = Arc::new(NodeState::new(
            config.node.id.clone(),
            config.node.mode,
            config.node.capacity_bytes,
            config.node.replication_factor,
        ));

        let wal = WalService::open(
            &config.node.data_dir,
            Arc::clone(&store),
            AttributeManager::new(Arc::clone(&store)),
            db.clone(),
            Arc::clone(&node),
            config.wal.compact_threshold,
        )
        .await?;

        let files = Arc::new(FileService::new(
            store,
            db.clone(),
            Arc::new(wal),
            Arc::clone(&node),
            peers,
            config.max_upload_size,
        ));
        let report = files.recover().await?;

        Ok((
            Self {
                config,
                files,
                search: SearchEngine::new(db, Arc::clone(&node)),
                node,
                verifier,
            },
            report,
        ))
    }
}
