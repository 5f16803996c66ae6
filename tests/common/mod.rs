#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use tempfile::TempDir;

use file_node::auth::{Claims, Role, TokenVerifier};
use file_node::config::Config;
use file_node::files::{FileService, PeerClient, PeerError, PeerReceipt};
use file_node::object_store::{collect_stream, once_stream, ByteStream, LocalStore, ObjectStore};
use file_node::storage::models::{FileRecord, NewFile};
use file_node::wal::RecoveryReport;
use file_node::AppState;

/// Configuration for a node rooted in `dir`, with background tasks and auth off.
/// `overrides` are applied as environment variables.
pub fn config(dir: &Path, overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("NODE_ID".into(), "node-test".into()),
        ("DATA_DIR".into(), dir.join("data").display().to_string()),
        ("LOCAL_STORAGE_PATH".into(), dir.join("files").display().to_string()),
        ("AUTH_REQUIRED".into(), "false".into()),
        ("RETENTION_SWEEP_INTERVAL".into(), "0".into()),
        ("CONSISTENCY_SCAN_INTERVAL".into(), "0".into()),
    ]);
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }
    Config::from_vars(|key| vars.get(key).cloned()).unwrap()
}

pub struct TestNode {
    pub dir: TempDir,
    pub state: Arc<AppState>,
    pub report: RecoveryReport,
}

impl TestNode {
    pub async fn start(overrides: &[(&str, &str)]) -> Self {
        Self::with(overrides, Arc::new(NoPeers), TokenVerifier::disabled()).await
    }

    pub async fn with(
        overrides: &[(&str, &str)],
        peers: Arc<dyn PeerClient>,
        verifier: TokenVerifier,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (state, report) = open_state(dir.path(), overrides, peers, verifier).await;
        Self {
            dir,
            state: Arc::new(state),
            report,
        }
    }

    pub fn files(&self) -> &Arc<FileService> {
        &self.state.files
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(self.state.files.store())
    }

    /// Every regular file under the local storage root, in-flight uploads included.
    pub fn files_on_disk(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![self.dir.path().join("files")];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        found.sort();
        found
    }
}

/// Open (or reopen) the node stored under `dir`.
pub async fn open_state(
    dir: &Path,
    overrides: &[(&str, &str)],
    peers: Arc<dyn PeerClient>,
    verifier: TokenVerifier,
) -> (AppState, RecoveryReport) {
    let config = config(dir, overrides);
    let store: Arc<dyn ObjectStore> =
        Arc::new(LocalStore::new(&config.storage.local_storage_path).unwrap());
    AppState::open(config, store, peers, verifier).await.unwrap()
}

pub fn new_file(filename: &str) -> NewFile {
    NewFile {
        filename: filename.to_string(),
        ..Default::default()
    }
}

pub fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn content(data: &[u8]) -> ByteStream {
    once_stream(Bytes::copy_from_slice(data))
}

/// Deterministic, non-repeating test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub async fn read_all(stream: ByteStream) -> Vec<u8> {
    collect_stream(stream).await.unwrap().to_vec()
}

/// Sample index row for tests that bypass the File Service.
pub fn sample_record(id: &str, filename: &str, uploader: &str) -> FileRecord {
    let now = Utc::now();
    let mut record = FileRecord {
        id: id.to_string(),
        storage_path: file_node::object_store::blob_key(id),
        checksum: "ab".repeat(32),
        size_bytes: 1024,
        mime_type: "application/pdf".to_string(),
        original_filename: filename.to_string(),
        description: None,
        tags: BTreeMap::new(),
        uploader: uploader.to_string(),
        created_at: now,
        updated_at: now,
        retention_days: None,
        search_vector: Default::default(),
    };
    record.refresh_search_vector();
    record
}

// ============================================================================
// Peers
// ============================================================================

/// Peer client for nodes that never transfer.
pub struct NoPeers;

#[async_trait]
impl PeerClient for NoPeers {
    async fn push(
        &self,
        target: &str,
        _record: &FileRecord,
        _content: ByteStream,
        _token: Option<&str>,
    ) -> Result<PeerReceipt, PeerError> {
        Err(PeerError::InvalidResponse(format!("no peer at {target}")))
    }
}

/// Peer that uploads straight into another in-process node's File Service.
pub struct LocalPeer {
    pub target: Arc<FileService>,
}

#[async_trait]
impl PeerClient for LocalPeer {
    async fn push(
        &self,
        _target: &str,
        record: &FileRecord,
        content: ByteStream,
        _token: Option<&str>,
    ) -> Result<PeerReceipt, PeerError> {
        let metadata = NewFile::from_record(record);
        match self.target.create(content, metadata, &record.uploader).await {
            Ok(copy) => Ok(PeerReceipt {
                id: copy.id,
                checksum: copy.checksum,
                size_bytes: copy.size_bytes,
            }),
            Err(file_node::files::FileError::StorageFull(reason)) => Err(PeerError::Full(reason)),
            Err(e) => Err(PeerError::Rejected {
                status: 500,
                body: e.to_string(),
            }),
        }
    }
}

/// Peer that consumes the content and then reports a different checksum.
pub struct LyingPeer;

#[async_trait]
impl PeerClient for LyingPeer {
    async fn push(
        &self,
        _target: &str,
        record: &FileRecord,
        content: ByteStream,
        _token: Option<&str>,
    ) -> Result<PeerReceipt, PeerError> {
        let _ = collect_stream(content).await;
        Ok(PeerReceipt {
            id: uuid::Uuid::new_v4().to_string(),
            checksum: "00".repeat(32),
            size_bytes: record.size_bytes,
        })
    }
}

// ============================================================================
// Tokens
// ============================================================================

/// Stand-in for the registry's signing key.
pub struct Registry {
    key_pair: Ed25519KeyPair,
}

impl Registry {
    pub fn new() -> Self {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
        Self {
            key_pair: Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap(),
        }
    }

    pub fn verifier(&self) -> TokenVerifier {
        TokenVerifier::new(Some(self.key_pair.public_key().as_ref().to_vec()), true, 30)
    }

    /// Token for `subject`, valid for an hour.
    pub fn token(&self, subject: &str, role: Role) -> String {
        let now = Utc::now().timestamp();
        self.sign(&Claims {
            sub: subject.to_string(),
            role,
            exp: now + 3600,
            iat: Some(now),
        })
    }

    pub fn sign(&self, claims: &Claims) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"EdDSA","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        let unsigned = format!("{header}.{payload}");
        let signature = URL_SAFE_NO_PAD.encode(self.key_pair.sign(unsigned.as_bytes()));
        format!("{unsigned}.{signature}")
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Serve the node's router on an ephemeral port, returning its base URL.
pub async fn serve(state: Arc<AppState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = file_node::api::create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
