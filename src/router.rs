//! Inbound message handlers.
//!
//! [`MessageRouter::route`] takes one decoded frame from a session and applies
//! it to the store, the correlator and the outbox. Handler failures are
//! logged here and never returned: the session's read loop must keep running.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::correlation::{Completion, CorrelationError, Correlator};
use crate::models::{
    AlarmRecord, AlarmSource, CommandDetail, CommandKind, DeviceUpdate, IncomingSmsRecord,
    Severity, SimRecord, SimUpdate, TelemetryRecord,
};
use crate::outbox::{Outbox, ALARM_QUEUE, DELIVERY_REPORT_QUEUE, SMS_QUEUE};
use crate::protocol::{
    ClientAlarm, DeliveryReport, DeliveryStatus, DeviceReport, InboundMessage, IncomingSms,
    PhoneNumberResult, UssdResult,
};
use crate::store::{Store, StoreError};
use crate::util::now_ms;

#[derive(Debug, thiserror::Error)]
enum RouteError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ReportKind {
    Registration,
    Status,
}

pub struct MessageRouter {
    store: Arc<dyn Store>,
    outbox: Outbox,
    correlator: Correlator,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn Store>, outbox: Outbox, correlator: Correlator) -> Self {
        Self {
            store,
            outbox,
            correlator,
        }
    }

    /// Handle one non-auth message. `device_id` is the connection's bound
    /// device, or empty if it never authenticated.
    pub async fn route(&self, device_id: &str, msg: InboundMessage) {
        let kind = msg.kind().to_string();
        let result = match msg {
            InboundMessage::DeviceRegistration(report) => {
                self.on_device_report(device_id, report, ReportKind::Registration)
                    .await
            }
            InboundMessage::DeviceStatus(report) => {
                self.on_device_report(device_id, report, ReportKind::Status)
                    .await
            }
            InboundMessage::IncomingSms(sms) => self.on_incoming_sms(device_id, sms).await,
            InboundMessage::SmsDeliveryReport(dlr) => self.on_delivery_report(device_id, dlr).await,
            InboundMessage::UssdResult(res) => self.on_ussd_result(device_id, res).await,
            InboundMessage::PhoneNumberResult(res) => self.on_phone_number(device_id, res).await,
            InboundMessage::Alarm(alarm) => self.on_alarm(device_id, alarm).await,
            InboundMessage::Auth(_) => {
                debug!(device_id, "Auth message reached router, ignoring");
                Ok(())
            }
            InboundMessage::Unknown(kind) => {
                info!(device_id, kind = %kind, "Unknown message type, skipping");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(device_id, kind = %kind, error = %e, "Failed to handle message");
        }
    }

    async fn on_device_report(
        &self,
        session_device: &str,
        report: DeviceReport,
        kind: ReportKind,
    ) -> Result<(), RouteError> {
        // The report names its own device; fall back to the session's binding.
        let device_id = if report.device_id.is_empty() {
            session_device.to_string()
        } else {
            report.device_id.clone()
        };
        let now = now_ms();

        let mut update = DeviceUpdate {
            battery_level: Some(report.battery_percent()),
            battery_status: Some(report.battery_status.clone()),
            signal_strength: report.signal_strength,
            operator_status: report.operator_status,
            latitude: Some(report.latitude),
            longitude: Some(report.longitude),
            last_seen: Some(now),
            ..DeviceUpdate::default()
        };
        if kind == ReportKind::Registration {
            update.device_name = Some(report.device_name.clone());
            update.model = Some(report.model.clone());
            update.android_version = Some(report.android_version.clone());
            update.app_version = Some(report.app_version.clone());
        }
        self.store.update_device(&device_id, update).await?;

        let sims: Vec<SimRecord> = report.sim_cards.iter().cloned().map(SimRecord::from).collect();
        let sim_count = sims.len();
        self.store.replace_sims(&device_id, sims).await?;

        self.store
            .insert_telemetry(TelemetryRecord {
                device_id: device_id.clone(),
                battery_level: report.battery_percent(),
                battery_status: report.battery_status,
                latitude: report.latitude,
                longitude: report.longitude,
                timestamp: report.timestamp,
                recorded_at: now,
            })
            .await?;

        if kind == ReportKind::Registration {
            info!(device_id = %device_id, sims = sim_count, "Device registered");
        } else {
            debug!(device_id = %device_id, sims = sim_count, "Device status updated");
        }
        Ok(())
    }

    async fn on_incoming_sms(&self, device_id: &str, sms: IncomingSms) -> Result<(), RouteError> {
        let id = self
            .store
            .insert_incoming_sms(IncomingSmsRecord {
                id: 0,
                device_id: device_id.to_string(),
                from: sms.from.clone(),
                message: sms.message.clone(),
                timestamp: sms.timestamp,
                received_at: now_ms(),
            })
            .await?;
        self.outbox.enqueue(
            SMS_QUEUE,
            json!({
                "type": "incoming_sms",
                "id": id,
                "device_id": device_id,
                "from": sms.from,
                "message": sms.message,
                "timestamp": sms.timestamp,
            }),
        );
        info!(device_id, from = %sms.from, "Incoming SMS stored");
        Ok(())
    }

    async fn on_delivery_report(
        &self,
        device_id: &str,
        dlr: DeliveryReport,
    ) -> Result<(), RouteError> {
        let status = dlr.status();
        let summary = dlr.summary();
        let err = (status == DeliveryStatus::Failed && !dlr.err.is_empty())
            .then_some(dlr.err.as_str());
        let transition = self
            .correlator
            .apply_delivery_report(device_id, dlr.id, status, &summary, err)
            .await?;
        if transition.is_applied() {
            let cmd = transition.command();
            let target = match &cmd.detail {
                CommandDetail::Sms { target, .. } => target.as_str(),
                _ => "",
            };
            self.outbox.enqueue(
                DELIVERY_REPORT_QUEUE,
                json!({
                    "device_id": device_id,
                    "internal_log_id": dlr.id,
                    "target": target,
                    "status": cmd.state.as_str(),
                    "delivery_report": summary,
                    "error_message": cmd.error_message,
                    "delivered_at": cmd.completed_at,
                }),
            );
        }
        Ok(())
    }

    async fn on_ussd_result(&self, device_id: &str, res: UssdResult) -> Result<(), RouteError> {
        self.correlator
            .complete(
                device_id,
                res.internal_log_id,
                CommandKind::Ussd,
                Completion {
                    success: res.success,
                    result: Some(res.result).filter(|r| !r.is_empty()),
                    error_message: Some(res.error_message).filter(|e| !e.is_empty()),
                },
            )
            .await?;
        Ok(())
    }

    async fn on_phone_number(
        &self,
        device_id: &str,
        res: PhoneNumberResult,
    ) -> Result<(), RouteError> {
        let transition = self
            .correlator
            .complete(
                device_id,
                res.internal_log_id,
                CommandKind::PhoneDiscovery,
                Completion {
                    success: res.success,
                    result: Some(res.phone_number.clone()).filter(|p| !p.is_empty()),
                    error_message: Some(res.error_message).filter(|e| !e.is_empty()),
                },
            )
            .await?;

        if transition.is_applied() && res.success && !res.phone_number.is_empty() {
            let slot = transition.command().detail.sim_slot();
            self.store
                .update_sim(
                    device_id,
                    slot,
                    SimUpdate {
                        phone_number: Some(res.phone_number.clone()),
                        ..SimUpdate::default()
                    },
                )
                .await?;
            info!(device_id, slot, phone_number = %res.phone_number, "SIM phone number discovered");
        }
        Ok(())
    }

    async fn on_alarm(&self, device_id: &str, alarm: ClientAlarm) -> Result<(), RouteError> {
        let severity = Severity::Medium;
        self.store
            .insert_alarm(AlarmRecord {
                id: 0,
                device_id: device_id.to_string(),
                source: AlarmSource::Client,
                alarm_type: alarm.alarm_type.clone(),
                title: String::new(),
                message: alarm.message.clone(),
                severity,
                resolved: false,
                timestamp: alarm.timestamp,
            })
            .await?;
        self.outbox.enqueue(
            ALARM_QUEUE,
            json!({
                "device_id": device_id,
                "type": "alarm",
                "alarm_type": alarm.alarm_type,
                "message": alarm.message,
                "severity": severity.as_str(),
            }),
        );
        warn!(device_id, alarm_type = %alarm.alarm_type, "Device raised alarm");
        Ok(())
    }
}
