use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::response::ApiError;
use crate::auth::Identity;
use crate::mode::Operation;
use crate::range::{self, MultipartLayout, RangeRequest};
use crate::storage::models::FileRecord;
use crate::AppState;

/// Serve file content, honouring `Range`, `If-Range` and `If-None-Match`.
/// Route: GET /files/:id/content
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    identity.authorize(Operation::Read)?;
    let file = state.files.get(&id)?;
    let len = file.size_bytes;

    if let Some(candidates) = header_str(&headers, header::IF_NONE_MATCH) {
        if range::none_match(candidates, &file.etag()) {
            return Ok(respond(StatusCode::NOT_MODIFIED, &file, Body::empty(), &[]));
        }
    }

    let precondition_holds = header_str(&headers, header::IF_RANGE)
        .map_or(true, |value| range::if_range_holds(value, &file.etag(), file.created_at));
    let requested = match header_str(&headers, header::RANGE) {
        Some(value) if precondition_holds => range::parse_range(value, len),
        _ => RangeRequest::Full,
    };

    let response = match requested {
        RangeRequest::Full => {
            let (file, content) = state.files.open(&id).await?;
            let length = file.size_bytes.to_string();
            respond(
                StatusCode::OK,
                &file,
                Body::from_stream(content),
                &[
                    (header::CONTENT_TYPE, file.mime_type.as_str()),
                    (header::CONTENT_LENGTH, length.as_str()),
                ],
            )
        }
        RangeRequest::Unsatisfiable => {
            tracing::debug!(file_id = %id, size_bytes = len, "Range not satisfiable");
            respond(
                StatusCode::RANGE_NOT_SATISFIABLE,
                &file,
                Body::empty(),
                &[(header::CONTENT_RANGE, range::unsatisfied_range(len).as_str())],
            )
        }
        RangeRequest::Partial(ranges) if ranges.len() == 1 => {
            let content = state.files.open_ranges(&file, &ranges).await?;
            let length = ranges[0].len().to_string();
            respond(
                StatusCode::PARTIAL_CONTENT,
                &file,
                Body::from_stream(content),
                &[
                    (header::CONTENT_TYPE, file.mime_type.as_str()),
                    (header::CONTENT_LENGTH, length.as_str()),
                    (header::CONTENT_RANGE, range::content_range(&ranges[0], len).as_str()),
                ],
            )
        }
        RangeRequest::Partial(ranges) => {
            let layout = MultipartLayout::new(&ranges, len, &file.mime_type);
            let content_type = layout.content_type();
            let length = layout.content_length().to_string();
            let body = layout.into_stream(Arc::clone(state.files.store()), file.storage_path.clone());
            respond(
                StatusCode::PARTIAL_CONTENT,
                &file,
                Body::from_stream(body),
                &[
                    (header::CONTENT_TYPE, content_type.as_str()),
                    (header::CONTENT_LENGTH, length.as_str()),
                ],
            )
        }
    };

    Ok(response)
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Build a response carrying the validators every content response shares.
fn respond(
    status: StatusCode,
    file: &FileRecord,
    body: Body,
    extra: &[(HeaderName, &str)],
) -> Response {
    let mut response = (status, body).into_response();
    let headers = response.headers_mut();

    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    insert(headers, header::ETAG, &file.etag());
    insert(headers, header::LAST_MODIFIED, &range::http_date(file.created_at));
    for (name, value) in extra {
        insert(headers, name.clone(), value);
    }

    // Content under an id never changes, only its metadata does
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=3600"),
    );
    if status == StatusCode::OK {
        let disposition = format!(
            "inline; filename=\"{}\"",
            file.original_filename.replace(['"', '\\'], "_")
        );
        insert(headers, header::CONTENT_DISPOSITION, &disposition);
    }

    response
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::debug!(header = %name, "Skipping header with invalid value"),
    }
}
