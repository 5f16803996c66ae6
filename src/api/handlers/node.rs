use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::api::response::JSend;
use crate::node::{HealthStatus, NodeStatus};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health(State(state): State<Arc<AppState>>) -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        status: state.node.status().status,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Capacity, usage and mode, polled by the registry.
pub async fn node_status(State(state): State<Arc<AppState>>) -> Json<JSend<NodeStatus>> {
    JSend::success(state.node.status())
}
