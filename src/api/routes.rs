use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Files
        .route(
            "/files",
            // Uploads stream straight to storage; the File Service enforces the size limit
            post(handlers::create_file).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/files/:id",
            get(handlers::get_file)
                .patch(handlers::update_file)
                .delete(handlers::delete_file),
        )
        .route("/files/:id/content", get(handlers::download_file))
        .route("/files/:id/similar", get(handlers::similar_files))
        .route("/files/:id/transfer", post(handlers::transfer_file))
        // Search
        .route("/search", get(handlers::search_files))
        // Internal
        .route("/_internal/status", get(handlers::node_status))
        .route("/_internal/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
