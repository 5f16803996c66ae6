use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;

use crate::api::response::ApiError;
use crate::auth::Identity;
use crate::AppState;

/// Resolves the caller from the `Authorization` header, rejecting with 401 when the node
/// requires a token and none (or an invalid one) is presented.
#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, ApiError> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .map(|value| {
                value
                    .to_str()
                    .map_err(|_| ApiError::unauthorized("Authorization header is not valid ASCII"))
            })
            .transpose()?;

        state
            .verifier
            .authenticate(header, Utc::now().timestamp())
            .map_err(|e| {
                tracing::debug!(error = %e, "Rejected request credentials");
                ApiError::from(e)
            })
    }
}
