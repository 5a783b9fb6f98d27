//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health`: liveness probe.
///
/// Returns status, version, uptime and the number of live device
/// connections. Reads the hub's published snapshot, so it answers even while
/// the registry loop is busy.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let stats = state.hub.stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "connected": stats.connected_clients,
        "outbox_dropped": state.outbox.dropped(),
    }))
}
