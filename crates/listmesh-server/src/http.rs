//! HTTP endpoint handlers

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;

/// Page size assumed when converting `/proc/self/statm` pages to bytes
const PAGE_SIZE: u64 = 4096;

/// Response for `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: String,
    pub uptime_secs: u64,
    /// Resident set size; `None` where `/proc` is unavailable
    pub memory_bytes: Option<u64>,
    pub active_users: usize,
    pub connections: usize,
    pub degraded_users: usize,
    pub websocket_url: String,
}

/// Liveness and load summary
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let degraded_users = state.registry.degraded_count().await;
    let status = if degraded_users == 0 { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: listmesh_core::version(),
        uptime_secs: state.uptime().as_secs(),
        memory_bytes: resident_memory(),
        active_users: state.registry.user_count(),
        connections: state.registry.connection_count(),
        degraded_users,
        websocket_url: state.websocket_url(),
    })
}

fn resident_memory() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * PAGE_SIZE)
}
