use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::response::{ApiError, AppQuery, JSendPaginated, Pagination};
use crate::auth::Identity;
use crate::mode::Operation;
use crate::search::{SearchFilters, SearchHit, SearchPage, SearchQuery};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

/// Query string of `GET /search`. Tags use the nested form `tags[type]=invoice`.
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    pub uploader: Option<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub mime_type: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl From<SearchParams> for SearchQuery {
    fn from(params: SearchParams) -> Self {
        SearchQuery {
            text: params.q,
            filters: SearchFilters {
                uploader: params.uploader,
                min_size: params.min_size,
                max_size: params.max_size,
                created_after: params.created_after,
                created_before: params.created_before,
                mime_type: params.mime_type,
                tags: params.tags,
            },
            offset: params.offset,
            limit: params.limit,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn search_files(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    AppQuery(params): AppQuery<SearchParams>,
) -> Result<Json<JSendPaginated<SearchHit>>, ApiError> {
    identity.authorize(Operation::Read)?;
    if params.limit == Some(0) {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }
    if let (Some(min), Some(max)) = (params.min_size, params.max_size) {
        if min > max {
            return Err(ApiError::bad_request("min_size must not exceed max_size"));
        }
    }

    let query = SearchQuery::from(params);
    let page = state
        .search
        .search(&query)
        .map_err(|e| ApiError::internal(e.to_string()))?;

    tracing::debug!(
        query = %query.text,
        total = page.total,
        returned = page.hits.len(),
        "Search"
    );
    Ok(paginated(page))
}

/// Files ranked against another file's terms.
/// Route: GET /files/:id/similar
pub async fn similar_files(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
    AppQuery(params): AppQuery<PageParams>,
) -> Result<Json<JSendPaginated<SearchHit>>, ApiError> {
    identity.authorize(Operation::Read)?;
    if params.limit == Some(0) {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let page = state
        .search
        .similar(&id, params.offset, params.limit)
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("File not found: {id}")))?;

    Ok(paginated(page))
}

fn paginated(page: SearchPage) -> Json<JSendPaginated<SearchHit>> {
    JSendPaginated::success(
        page.hits,
        Pagination {
            limit: page.limit,
            offset: page.offset,
            total: page.total,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_from_query_string() {
        let params: SearchParams = serde_qs::from_str(
            "q=tax+report&uploader=alice&min_size=10&tags[type]=invoice&tags[year]=2024&limit=5",
        )
        .unwrap();
        let query = SearchQuery::from(params);

        assert_eq!(query.text, "tax report");
        assert_eq!(query.filters.uploader.as_deref(), Some("alice"));
        assert_eq!(query.filters.min_size, Some(10));
        assert_eq!(query.filters.tags.len(), 2);
        assert_eq!(query.filters.tags["type"], "invoice");
        assert_eq!(query.limit, Some(5));
        assert_eq!(query.offset, 0);
    }

    #[test]
    fn test_empty_query_string() {
        let params: SearchParams = serde_qs::from_str("").unwrap();
        let query = SearchQuery::from(params);
        assert!(query.text.is_empty());
        assert_eq!(query.filters, SearchFilters::default());
    }
}
