//! Device wire protocol.
//!
//! Every text frame is a JSON envelope `{"type": <tag>, "data": {...}}`
//! (`payload` is accepted for `data`). Inbound frames decode into the closed
//! [`InboundMessage`] enum; anything with an unrecognised tag becomes
//! [`InboundMessage::Unknown`] so the session can log and skip it.
//!
//! ## Inbound (device → hub)
//!
//! | Type                  | Fields                                                     |
//! |-----------------------|------------------------------------------------------------|
//! | `auth`                | `connectkey`                                               |
//! | `device_registration` | `device_id`, `device_name`, `model`, `batteryLevel`, `simCards[]`, … |
//! | `device_status`       | same as registration                                       |
//! | `incoming_sms`        | `from`, `message`, `timestamp`                             |
//! | `sms_delivery_report` | `id`, `simSlot`, `sub`, `dlvrd`, `submit_date`, `done_date`, `stat`, `err`, `text` |
//! | `ussd_result`         | `internalLogId`, `success`, `result`, `errorMessage`       |
//! | `phone_number_result` | `internalLogId`, `success`, `phoneNumber`, `errorMessage`  |
//! | `alarm`               | `alarmType`, `message`, `timestamp`                        |
//!
//! ## Outbound (hub → device)
//!
//! See [`OutboundMessage`]. Outbound frames are flat: fields sit next to
//! `type`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{InternalLogId, OperatorStatus, SimRecord};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not a `{type, data}` JSON object.
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    /// The tag is known but its body does not match.
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    pub fn is_envelope(&self) -> bool {
        matches!(self, Self::Envelope(_))
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "payload")]
    data: Value,
    /// Some clients put the body next to `type` instead of under `data`.
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl RawEnvelope {
    fn into_body(self) -> Value {
        if self.data.is_null() {
            Value::Object(self.rest)
        } else {
            self.data
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthRequest {
    #[serde(default, alias = "connect_key", alias = "connectKey")]
    pub connectkey: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimCardInfo {
    pub identifier: String,
    pub imsi: String,
    pub imei: String,
    pub operator: String,
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
    #[serde(rename = "signalStrength")]
    pub signal_strength: i32,
    #[serde(rename = "networkType")]
    pub network_type: String,
    pub mcc: String,
    pub mnc: String,
    #[serde(rename = "isActive")]
    pub is_active: bool,
}

impl From<SimCardInfo> for SimRecord {
    fn from(sim: SimCardInfo) -> Self {
        SimRecord {
            slot: 0,
            identifier: sim.identifier,
            imsi: sim.imsi,
            imei: sim.imei,
            operator: sim.operator,
            phone_number: sim.phone_number,
            signal_strength: sim.signal_strength,
            network_type: sim.network_type,
            mcc: sim.mcc,
            mnc: sim.mnc,
            is_active: sim.is_active,
            is_enabled: true,
        }
    }
}

/// Body of `device_registration` and `device_status`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceReport {
    pub device_id: String,
    pub device_name: String,
    pub model: String,
    pub android_version: String,
    pub app_version: String,
    #[serde(rename = "batteryLevel")]
    pub battery_level: i32,
    #[serde(rename = "batteryStatus")]
    pub battery_status: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
    #[serde(rename = "signalStrength")]
    pub signal_strength: Option<i32>,
    #[serde(rename = "operatorStatus")]
    pub operator_status: Option<OperatorStatus>,
    #[serde(rename = "simCards")]
    pub sim_cards: Vec<SimCardInfo>,
}

impl DeviceReport {
    /// Battery level clamped to 0–100.
    pub fn battery_percent(&self) -> u8 {
        u8::try_from(self.battery_level.clamp(0, 100)).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct IncomingSms {
    pub from: String,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeliveryReport {
    pub id: InternalLogId,
    #[serde(rename = "simSlot")]
    pub sim_slot: u32,
    pub sub: i64,
    pub dlvrd: i64,
    pub submit_date: String,
    pub done_date: String,
    pub stat: String,
    pub err: String,
    pub text: String,
}

impl DeliveryReport {
    pub fn status(&self) -> DeliveryStatus {
        DeliveryStatus::from_stat(&self.stat)
    }

    /// One-line summary stored alongside the command.
    pub fn summary(&self) -> String {
        format!(
            "sub:{} dlvrd:{} submit_date:{} done_date:{} stat:{} err:{}",
            self.sub, self.dlvrd, self.submit_date, self.done_date, self.stat, self.err
        )
    }
}

/// Outcome a DLR `stat` code maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Failed,
    /// Intermediate states (`ENROUTE`, `ACCEPTD`, …). Not terminal.
    InProgress,
}

impl DeliveryStatus {
    pub fn from_stat(stat: &str) -> Self {
        match stat.trim().to_ascii_uppercase().as_str() {
            "DELIVRD" | "DELIVERED" => Self::Delivered,
            "UNDELIV" | "EXPIRED" | "REJECTD" | "DELETED" | "FAILED" | "UNKNOWN" => Self::Failed,
            _ => Self::InProgress,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UssdResult {
    pub internal_log_id: InternalLogId,
    pub success: bool,
    pub result: String,
    pub error_message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PhoneNumberResult {
    pub internal_log_id: InternalLogId,
    pub success: bool,
    pub phone_number: String,
    pub error_message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientAlarm {
    pub alarm_type: String,
    pub message: String,
    pub timestamp: i64,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Auth(AuthRequest),
    DeviceRegistration(DeviceReport),
    DeviceStatus(DeviceReport),
    IncomingSms(IncomingSms),
    SmsDeliveryReport(DeliveryReport),
    UssdResult(UssdResult),
    PhoneNumberResult(PhoneNumberResult),
    Alarm(ClientAlarm),
    /// Tag outside the closed set.
    Unknown(String),
}

impl InboundMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: RawEnvelope = serde_json::from_str(text).map_err(ProtocolError::Envelope)?;
        let kind = envelope.kind.clone();
        let body = envelope.into_body();
        let msg = match kind.as_str() {
            "auth" => Self::Auth(payload("auth", body)?),
            "device_registration" => {
                Self::DeviceRegistration(payload("device_registration", unwrap_legacy(body))?)
            }
            "device_status" => Self::DeviceStatus(payload("device_status", unwrap_legacy(body))?),
            "incoming_sms" => Self::IncomingSms(payload("incoming_sms", body)?),
            "sms_delivery_report" => Self::SmsDeliveryReport(payload("sms_delivery_report", body)?),
            "ussd_result" => Self::UssdResult(payload("ussd_result", body)?),
            "phone_number_result" => Self::PhoneNumberResult(payload("phone_number_result", body)?),
            "alarm" => Self::Alarm(payload("alarm", body)?),
            _ => Self::Unknown(kind),
        };
        Ok(msg)
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Auth(_) => "auth",
            Self::DeviceRegistration(_) => "device_registration",
            Self::DeviceStatus(_) => "device_status",
            Self::IncomingSms(_) => "incoming_sms",
            Self::SmsDeliveryReport(_) => "sms_delivery_report",
            Self::UssdResult(_) => "ussd_result",
            Self::PhoneNumberResult(_) => "phone_number_result",
            Self::Alarm(_) => "alarm",
            Self::Unknown(kind) => kind,
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    body: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(body).map_err(|source| ProtocolError::Payload { kind, source })
}

/// Older clients wrap the device report once more as `{"payload": {...}}`.
fn unwrap_legacy(body: Value) -> Value {
    match body {
        Value::Object(mut map) if !map.contains_key("device_id") && map.len() == 1 => {
            match map.remove("payload") {
                Some(inner @ Value::Object(_)) => inner,
                Some(other) => {
                    map.insert("payload".into(), other);
                    Value::Object(map)
                }
                None => Value::Object(map),
            }
        }
        other => other,
    }
}

/// Closed set of frames the hub sends to devices.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundMessage {
    AuthResponse {
        success: bool,
        #[serde(skip_serializing_if = "String::is_empty")]
        sitename: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        groupname: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        devicename: String,
    },
    SendSms {
        target: String,
        message: String,
        sim_slot: u32,
        internal_log_id: InternalLogId,
    },
    UssdCommand {
        ussd_code: String,
        sim_slot: u32,
        internal_log_id: InternalLogId,
    },
    DiscoverPhoneNumber {
        ussd_code: String,
        sim_slot: u32,
        internal_log_id: InternalLogId,
    },
    DisableDevice {
        device_id: String,
    },
    EnableDevice {
        device_id: String,
    },
    DisableSim {
        device_id: String,
        sim_slot: u32,
    },
    EnableSim {
        device_id: String,
        sim_slot: u32,
    },
    Alarm {
        title: String,
        message: String,
    },
    StatusRequest {
        request_battery: bool,
        request_location: bool,
        request_sim_info: bool,
    },
}

impl OutboundMessage {
    pub fn auth_failure() -> Self {
        Self::AuthResponse {
            success: false,
            sitename: String::new(),
            groupname: String::new(),
            devicename: String::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthResponse { .. } => "auth_response",
            Self::SendSms { .. } => "send_sms",
            Self::UssdCommand { .. } => "ussd_command",
            Self::DiscoverPhoneNumber { .. } => "discover_phone_number",
            Self::DisableDevice { .. } => "disable_device",
            Self::EnableDevice { .. } => "enable_device",
            Self::DisableSim { .. } => "disable_sim",
            Self::EnableSim { .. } => "enable_sim",
            Self::Alarm { .. } => "alarm",
            Self::StatusRequest { .. } => "status_request",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
