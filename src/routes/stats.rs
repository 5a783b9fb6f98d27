//! Hub connection statistics.
//!
//! - `GET /ws/stats`: snapshot published by the registry loop, behind the
//!   operator API key

use axum::{extract::State, Json};

use crate::hub::HubStats;
use crate::AppState;

/// `GET /ws/stats`: connected clients, authenticated devices and the number
/// of connections per device.
pub async fn stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats())
}
