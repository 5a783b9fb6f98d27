//! Out-of-band delivery reports.
//!
//! - `POST /api/reports/delivery`: apply a DLR that arrived outside the device
//!   connection (carrier callback, device HTTP fallback)
//!
//! Goes through the same correlator as in-band reports, so a report that
//! already arrived over the WebSocket is acknowledged without a second
//! `deliveryreport` event.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::correlation::CorrelationError;
use crate::models::{CommandDetail, InternalLogId};
use crate::outbox::DELIVERY_REPORT_QUEUE;
use crate::protocol::DeliveryStatus;
use crate::AppState;

/// Request body for `POST /api/reports/delivery`.
#[derive(Debug, Deserialize)]
pub struct DeliveryReportRequest {
    pub device_id: String,
    pub internal_log_id: InternalLogId,
    /// `delivered`, `failed`, or a raw DLR `stat` code.
    pub status: String,
    #[serde(default)]
    pub delivery_report: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// `POST /api/reports/delivery`
///
/// # Errors
///
/// - `404 Not Found` with `{"code":"NOT_FOUND"}`: no command for the pair
/// - `409 Conflict` with `{"code":"NOT_SMS"}`: the command is not an SMS
/// - `500 Internal Server Error` with `{"code":"STORE_FAILED"}`
pub async fn delivery_report(
    State(state): State<AppState>,
    Json(req): Json<DeliveryReportRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let status = DeliveryStatus::from_stat(&req.status);
    let error_message = Some(req.error_message.as_str()).filter(|e| !e.is_empty());

    let transition = state
        .correlator
        .apply_delivery_report(
            &req.device_id,
            req.internal_log_id,
            status,
            &req.delivery_report,
            error_message,
        )
        .await
        .map_err(|e| {
            warn!(device_id = %req.device_id, internal_log_id = req.internal_log_id, error = %e, "Delivery report rejected");
            match e {
                CorrelationError::NotFound { .. } => error(StatusCode::NOT_FOUND, "NOT_FOUND", &e),
                CorrelationError::KindMismatch { .. } => error(StatusCode::CONFLICT, "NOT_SMS", &e),
                CorrelationError::Store(_) => {
                    error(StatusCode::INTERNAL_SERVER_ERROR, "STORE_FAILED", &e)
                }
            }
        })?;

    let applied = transition.is_applied();
    let cmd = transition.command();
    if applied {
        let target = match &cmd.detail {
            CommandDetail::Sms { target, .. } => target.as_str(),
            _ => "",
        };
        state.outbox.enqueue(
            DELIVERY_REPORT_QUEUE,
            json!({
                "device_id": req.device_id,
                "internal_log_id": req.internal_log_id,
                "target": target,
                "status": cmd.state.as_str(),
                "delivery_report": req.delivery_report,
                "error_message": cmd.error_message,
                "delivered_at": cmd.completed_at,
                "timestamp": req.timestamp,
            }),
        );
    }
    info!(
        device_id = %req.device_id,
        internal_log_id = req.internal_log_id,
        state = cmd.state.as_str(),
        applied,
        "Delivery report processed"
    );

    Ok(Json(json!({
        "success": true,
        "state": cmd.state.as_str(),
        "applied": applied,
    })))
}

fn error(status: StatusCode, code: &str, err: &CorrelationError) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "code": code, "error": err.to_string() })))
}
