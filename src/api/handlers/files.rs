use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::api::response::{ApiError, AppJson, AppQuery, JSend};
use crate::auth::Identity;
use crate::files::PeerReceipt;
use crate::mode::Operation;
use crate::object_store::ByteStream;
use crate::storage::models::{FileRecord, FileUpdate, NewFile, Patch};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateFileRequest {
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub original_filename: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub retention_days: Option<Option<u32>>,
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub target_node: String,
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub file_id: String,
    pub target_node: String,
    pub remote: PeerReceipt,
}

/// Distinguishes between a missing field (`None`) and an explicit `null` (`Some(None)`).
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: DeserializeOwned,
    D: Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

impl From<UpdateFileRequest> for FileUpdate {
    fn from(req: UpdateFileRequest) -> Self {
        FileUpdate {
            description: Patch::from(req.description),
            original_filename: req.original_filename,
            retention_days: Patch::from(req.retention_days),
            tags: req.tags,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Upload: raw body, metadata in the query string, mime type from `Content-Type`.
pub async fn create_file(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    headers: HeaderMap,
    AppQuery(mut metadata): AppQuery<NewFile>,
    body: Body,
) -> Result<Json<JSend<FileRecord>>, ApiError> {
    identity.authorize(Operation::Create)?;

    metadata.mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|essence| essence.trim().to_lowercase());

    let content: ByteStream = body
        .into_data_stream()
        .map_err(std::io::Error::other)
        .boxed();

    let record = state
        .files
        .create(content, metadata, &identity.subject)
        .await?;

    tracing::debug!(
        file_id = %record.id,
        uploader = %record.uploader,
        size_bytes = record.size_bytes,
        "Created file"
    );
    Ok(JSend::success(record))
}

pub async fn get_file(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<JSend<FileRecord>>, ApiError> {
    identity.authorize(Operation::Read)?;
    let file = state.files.get(&id)?;
    Ok(JSend::success(file))
}

pub async fn update_file(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
    AppJson(req): AppJson<UpdateFileRequest>,
) -> Result<Json<JSend<FileRecord>>, ApiError> {
    identity.authorize(Operation::Update)?;

    let update = FileUpdate::from(req);
    if update.is_empty() {
        return Err(ApiError::bad_request(
            "at least one field (description, original_filename, retention_days, tags) must be provided",
        ));
    }

    let file = state.files.update(&id, update).await?;
    tracing::debug!(file_id = %id, "Updated file");
    Ok(JSend::success(file))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<JSend<()>>, ApiError> {
    identity.authorize(Operation::Delete)?;
    state.files.delete(&id).await?;
    tracing::debug!(file_id = %id, "Deleted file");
    Ok(JSend::success(()))
}

/// Move a file to another node, forwarding the caller's token to it.
pub async fn transfer_file(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
    AppJson(req): AppJson<TransferRequest>,
) -> Result<Json<JSend<TransferResponse>>, ApiError> {
    identity.authorize(Operation::Transfer)?;

    let remote = state
        .files
        .transfer(&id, &req.target_node, identity.token.as_deref())
        .await?;

    Ok(JSend::success(TransferResponse {
        file_id: id,
        target_node: req.target_node,
        remote,
    }))
}
