//! Command-sender service.
//!
//! Every call has exactly two synchronous outcomes: the frame was handed to a
//! live connection, or the call was rejected (bad input, no eligible device,
//! device not connected). Whatever happens on the device afterwards is only
//! visible through the command's correlated state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::SelectorConfig;
use crate::correlation::{CorrelationError, Correlator};
use crate::hub::{Hub, HubError};
use crate::models::{
    AlarmRecord, AlarmSource, CommandDetail, CommandState, DeviceRecord, DeviceUpdate,
    InternalLogId, Severity, SimUpdate,
};
use crate::outbox::{Outbox, ALARM_QUEUE, DEVICE_QUEUE, USSD_QUEUE};
use crate::protocol::OutboundMessage;
use crate::selector::{self, SelectionError, SelectionRequest};
use crate::store::{Store, StoreError};
use crate::util::{is_valid_phone_number, now_ms, strip_phone_separators};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid phone number: {0}")]
    InvalidDestination(String),
    #[error("message is empty")]
    EmptyMessage,
    #[error("device {0} not found")]
    UnknownDevice(String),
    #[error("device {device_id} has no SIM in slot {slot}")]
    UnknownSim { device_id: String, slot: u32 },
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default)]
pub struct SmsRequest {
    pub destination: String,
    pub message: String,
    pub country: Option<String>,
    pub operator: Option<String>,
    /// Caller-chosen correlation id; generated when absent.
    pub internal_log_id: Option<InternalLogId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmsReceipt {
    pub device_id: String,
    pub sim_slot: u32,
    pub internal_log_id: InternalLogId,
    pub destination: String,
    pub units: usize,
    pub estimated_cost: f64,
    pub state: CommandState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReceipt {
    pub device_id: String,
    pub internal_log_id: InternalLogId,
}

pub struct SmsGateway {
    hub: Hub,
    store: Arc<dyn Store>,
    correlator: Correlator,
    outbox: Outbox,
    selector: SelectorConfig,
    next_log_id: AtomicU64,
}

impl SmsGateway {
    pub fn new(
        hub: Hub,
        store: Arc<dyn Store>,
        correlator: Correlator,
        outbox: Outbox,
        selector: SelectorConfig,
    ) -> Self {
        Self {
            hub,
            store,
            correlator,
            outbox,
            selector,
            next_log_id: AtomicU64::new(now_ms()),
        }
    }

    fn log_id(&self, requested: Option<InternalLogId>) -> InternalLogId {
        requested.unwrap_or_else(|| self.next_log_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Select the best device/SIM and send.
    pub async fn send_sms(&self, request: SmsRequest) -> Result<SmsReceipt, GatewayError> {
        let destination = validate(&request.destination, &request.message)?;
        let devices = self.store.devices().await?;
        let selection = selector::select_device(
            &devices,
            &SelectionRequest {
                destination: &destination,
                country: request.country.as_deref(),
                operator: request.operator.as_deref(),
            },
            &self.selector,
        )?;
        let device_id = selection.device.device_id.clone();
        let sim_slot = selection.sim.slot;
        info!(
            device_id = %device_id,
            sim_slot,
            battery = selection.device.battery_level,
            "Selected device for SMS"
        );
        self.send_sms_via(
            device_id,
            sim_slot,
            destination,
            request.message,
            request.internal_log_id,
        )
        .await
    }

    /// Send through an explicit device and SIM, skipping selection.
    pub async fn send_sms_direct(
        &self,
        device_id: &str,
        sim_slot: u32,
        destination: &str,
        message: &str,
        internal_log_id: Option<InternalLogId>,
    ) -> Result<SmsReceipt, GatewayError> {
        let destination = validate(destination, message)?;
        self.require_sim(device_id, sim_slot).await?;
        self.send_sms_via(
            device_id.to_string(),
            sim_slot,
            destination,
            message.to_string(),
            internal_log_id,
        )
        .await
    }

    async fn send_sms_via(
        &self,
        device_id: String,
        sim_slot: u32,
        destination: String,
        message: String,
        internal_log_id: Option<InternalLogId>,
    ) -> Result<SmsReceipt, GatewayError> {
        let internal_log_id = self.log_id(internal_log_id);
        let units = selector::message_units(&message);
        let estimated_cost = selector::estimate_cost(&destination, &message, &self.selector);

        self.correlator
            .open(
                &device_id,
                internal_log_id,
                CommandDetail::Sms {
                    target: destination.clone(),
                    message: message.clone(),
                    sim_slot,
                },
            )
            .await?;
        self.dispatch(
            &device_id,
            internal_log_id,
            OutboundMessage::SendSms {
                target: destination.clone(),
                message,
                sim_slot,
                internal_log_id,
            },
        )
        .await?;

        Ok(SmsReceipt {
            device_id,
            sim_slot,
            internal_log_id,
            destination,
            units,
            estimated_cost,
            state: CommandState::Sent,
        })
    }

    pub async fn send_ussd(
        &self,
        device_id: &str,
        sim_slot: u32,
        ussd_code: &str,
        internal_log_id: Option<InternalLogId>,
    ) -> Result<CommandReceipt, GatewayError> {
        let internal_log_id = self.log_id(internal_log_id);
        self.correlator
            .open(
                device_id,
                internal_log_id,
                CommandDetail::Ussd {
                    ussd_code: ussd_code.to_string(),
                    sim_slot,
                },
            )
            .await?;
        self.dispatch(
            device_id,
            internal_log_id,
            OutboundMessage::UssdCommand {
                ussd_code: ussd_code.to_string(),
                sim_slot,
                internal_log_id,
            },
        )
        .await?;
        self.outbox.enqueue(
            USSD_QUEUE,
            json!({
                "device_id": device_id,
                "type": "ussd_command",
                "ussdCode": ussd_code,
                "simSlot": sim_slot,
                "internalLogId": internal_log_id,
            }),
        );
        Ok(CommandReceipt {
            device_id: device_id.to_string(),
            internal_log_id,
        })
    }

    /// Ask the device to find a SIM's own number via USSD. A successful
    /// result writes the number onto that SIM.
    pub async fn discover_phone_number(
        &self,
        device_id: &str,
        sim_slot: u32,
        ussd_code: &str,
    ) -> Result<CommandReceipt, GatewayError> {
        self.require_sim(device_id, sim_slot).await?;
        let internal_log_id = self.log_id(None);
        self.correlator
            .open(
                device_id,
                internal_log_id,
                CommandDetail::PhoneDiscovery {
                    ussd_code: ussd_code.to_string(),
                    sim_slot,
                },
            )
            .await?;
        self.dispatch(
            device_id,
            internal_log_id,
            OutboundMessage::DiscoverPhoneNumber {
                ussd_code: ussd_code.to_string(),
                sim_slot,
                internal_log_id,
            },
        )
        .await?;
        Ok(CommandReceipt {
            device_id: device_id.to_string(),
            internal_log_id,
        })
    }

    /// Persist the device's active flag, then tell the device.
    pub async fn set_device_enabled(
        &self,
        device_id: &str,
        enabled: bool,
    ) -> Result<(), GatewayError> {
        self.store
            .update_device(
                device_id,
                DeviceUpdate {
                    is_active: Some(enabled),
                    ..DeviceUpdate::default()
                },
            )
            .await?;
        let msg = if enabled {
            OutboundMessage::EnableDevice {
                device_id: device_id.to_string(),
            }
        } else {
            OutboundMessage::DisableDevice {
                device_id: device_id.to_string(),
            }
        };
        let command = msg.kind();
        self.hub.send_to_device(device_id, &msg).await?;
        self.outbox.enqueue(
            DEVICE_QUEUE,
            json!({"device_id": device_id, "command": command, "data": {}}),
        );
        info!(device_id, enabled, "Device enabled flag changed");
        Ok(())
    }

    /// Persist a SIM's enabled flag, then tell the device.
    pub async fn set_sim_enabled(
        &self,
        device_id: &str,
        sim_slot: u32,
        enabled: bool,
    ) -> Result<(), GatewayError> {
        self.require_sim(device_id, sim_slot).await?;
        self.store
            .update_sim(
                device_id,
                sim_slot,
                SimUpdate {
                    is_enabled: Some(enabled),
                    ..SimUpdate::default()
                },
            )
            .await?;
        let msg = if enabled {
            OutboundMessage::EnableSim {
                device_id: device_id.to_string(),
                sim_slot,
            }
        } else {
            OutboundMessage::DisableSim {
                device_id: device_id.to_string(),
                sim_slot,
            }
        };
        let command = msg.kind();
        self.hub.send_to_device(device_id, &msg).await?;
        self.outbox.enqueue(
            DEVICE_QUEUE,
            json!({"device_id": device_id, "command": command, "data": {"simSlot": sim_slot}}),
        );
        info!(device_id, sim_slot, enabled, "SIM enabled flag changed");
        Ok(())
    }

    /// Send a server-originated alarm, then record and publish it.
    pub async fn send_alarm(
        &self,
        device_id: &str,
        title: &str,
        message: &str,
    ) -> Result<(), GatewayError> {
        self.hub
            .send_to_device(
                device_id,
                &OutboundMessage::Alarm {
                    title: title.to_string(),
                    message: message.to_string(),
                },
            )
            .await?;
        let severity = Severity::Medium;
        let timestamp = i64::try_from(now_ms() / 1000).unwrap_or(i64::MAX);
        if let Err(e) = self
            .store
            .insert_alarm(AlarmRecord {
                id: 0,
                device_id: device_id.to_string(),
                source: AlarmSource::Server,
                alarm_type: "manual".into(),
                title: title.to_string(),
                message: message.to_string(),
                severity,
                resolved: false,
                timestamp,
            })
            .await
        {
            warn!(device_id, error = %e, "Failed to record server alarm");
        }
        self.outbox.enqueue(
            ALARM_QUEUE,
            json!({
                "device_id": device_id,
                "type": "alarm",
                "alarm_type": "manual",
                "message": message,
                "severity": severity.as_str(),
            }),
        );
        Ok(())
    }

    pub async fn request_status(
        &self,
        device_id: &str,
        battery: bool,
        location: bool,
        sim_info: bool,
    ) -> Result<(), GatewayError> {
        self.hub
            .send_to_device(
                device_id,
                &OutboundMessage::StatusRequest {
                    request_battery: battery,
                    request_location: location,
                    request_sim_info: sim_info,
                },
            )
            .await?;
        Ok(())
    }

    /// Enqueue `msg` on every live connection; returns how many took it.
    pub async fn broadcast(&self, msg: &OutboundMessage) -> Result<usize, GatewayError> {
        Ok(self.hub.broadcast(msg).await?)
    }

    async fn require_sim(&self, device_id: &str, slot: u32) -> Result<DeviceRecord, GatewayError> {
        let device = self
            .store
            .device(device_id)
            .await?
            .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_string()))?;
        if device.sims.iter().any(|s| s.slot == slot) {
            Ok(device)
        } else {
            Err(GatewayError::UnknownSim {
                device_id: device_id.to_string(),
                slot,
            })
        }
    }

    /// Hand `msg` to the hub and move the command to `sent` or `failed`.
    /// A hub timeout leaves it `pending`: the command never reached the
    /// hub's queue, so its outcome is still open.
    async fn dispatch(
        &self,
        device_id: &str,
        internal_log_id: InternalLogId,
        msg: OutboundMessage,
    ) -> Result<(), GatewayError> {
        match self.hub.send_to_device(device_id, &msg).await {
            Ok(conn) => {
                info!(device_id, internal_log_id, conn = %conn, kind = msg.kind(), "Command handed to connection");
                if let Err(e) = self.correlator.mark_sent(device_id, internal_log_id).await {
                    warn!(device_id, internal_log_id, error = %e, "Failed to mark command sent");
                }
                Ok(())
            }
            Err(e @ HubError::Timeout(_)) => {
                warn!(device_id, internal_log_id, error = %e, "Hub busy, command left pending");
                Err(e.into())
            }
            Err(e) => {
                warn!(device_id, internal_log_id, error = %e, "Command rejected by hub");
                if let Err(ce) = self
                    .correlator
                    .mark_failed(device_id, internal_log_id, &e.to_string())
                    .await
                {
                    warn!(device_id, internal_log_id, error = %ce, "Failed to mark command failed");
                }
                Err(e.into())
            }
        }
    }
}

/// Cleaned destination, or the reason it was refused.
fn validate(destination: &str, message: &str) -> Result<String, GatewayError> {
    if !is_valid_phone_number(destination) {
        return Err(GatewayError::InvalidDestination(destination.to_string()));
    }
    if message.is_empty() {
        return Err(GatewayError::EmptyMessage);
    }
    Ok(strip_phone_separators(destination).into_owned())
}
