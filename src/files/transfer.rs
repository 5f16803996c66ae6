//! Pushing a file to another storage node's upload boundary.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::object_store::ByteStream;
use crate::storage::models::{FileRecord, NewFile};

/// What the target node reports after committing the copy.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, Deserialize)]
pub struct PeerReceipt {
    pub id: String,
    pub checksum: String,
    pub size_bytes: u64,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("target node has no room: {0}")]
    Full(String),
    #[error("target rejected the transfer ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("target unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("unexpected response from target: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Upload `content` with `record`'s metadata to `target`, returning the target's receipt
    /// once it has committed the file.
    async fn push(
        &self,
        target: &str,
        record: &FileRecord,
        content: ByteStream,
        token: Option<&str>,
    ) -> Result<PeerReceipt, PeerError>;
}

#[derive(Deserialize)]
struct Envelope {
    data: PeerReceipt,
}

/// [`PeerClient`] speaking the node's own HTTP upload API.
pub struct HttpPeerClient {
    client: Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn push(
        &self,
        target: &str,
        record: &FileRecord,
        content: ByteStream,
        token: Option<&str>,
    ) -> Result<PeerReceipt, PeerError> {
        let query = serde_qs::to_string(&NewFile::from_record(record))
            .map_err(|e| PeerError::InvalidResponse(format!("failed to encode metadata: {e}")))?;
        let url = format!("{}/files?{query}", target.trim_end_matches('/'));

        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, &record.mime_type)
            .body(reqwest::Body::wrap_stream(content));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::INSUFFICIENT_STORAGE {
            return Err(PeerError::Full(response.text().await.unwrap_or_default()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PeerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| PeerError::InvalidResponse(e.to_string()))?;

        tracing::debug!(
            file_id = %record.id,
            target,
            remote_id = %envelope.data.id,
            "Target node accepted transfer"
        );
        Ok(envelope.data)
    }
}
