//! HTTP surface.
//!
//! | Method | Path                    | Auth    | Description                        |
//! |--------|-------------------------|---------|------------------------------------|
//! | GET    | `/health`               | No      | Liveness probe                     |
//! | GET    | `/ws`                   | In-band | Device WebSocket (connect key)     |
//! | GET    | `/ws/stats`             | Bearer  | Hub connection counts              |
//! | POST   | `/api/reports/delivery` | Bearer  | Out-of-band SMS delivery report    |

pub mod health;
pub mod reports;
pub mod stats;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::session;
use crate::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health::health))
        .route("/ws", get(session::ws_upgrade));

    let authed_routes = Router::new()
        .route("/ws/stats", get(stats::stats))
        .route("/api/reports/delivery", post(reports::delivery_report))
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
