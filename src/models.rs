//! Persisted records owned by the external store.
//!
//! The hub never deletes these. Devices and SIM inventories are created or
//! refreshed by registration/status messages, pending commands are opened by
//! command senders and closed by results or delivery reports.

use serde::{Deserialize, Serialize};

/// Caller-chosen token correlating an outbound command with its result.
/// Scoped per device: `(device_id, internal_log_id)` is the key.
pub type InternalLogId = u64;

/// Link state between a device and its mobile operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorStatus {
    Online,
    #[default]
    Offline,
    Connecting,
}

/// Site metadata. `country` is what country filters match against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub name: String,
    #[serde(default)]
    pub country: String,
}

/// Device group metadata. `operator` is what operator filters match against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    #[serde(default)]
    pub operator: String,
}

/// A SIM card in a device, in the order the device reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimRecord {
    /// Position in the device's inventory; sent as `simSlot` in commands.
    pub slot: u32,
    pub identifier: String,
    pub imsi: String,
    pub imei: String,
    pub operator: String,
    pub phone_number: String,
    pub signal_strength: i32,
    pub network_type: String,
    pub mcc: String,
    pub mnc: String,
    pub is_active: bool,
    pub is_enabled: bool,
}

impl Default for SimRecord {
    fn default() -> Self {
        Self {
            slot: 0,
            identifier: String::new(),
            imsi: String::new(),
            imei: String::new(),
            operator: String::new(),
            phone_number: String::new(),
            signal_strength: 0,
            network_type: String::new(),
            mcc: String::new(),
            mnc: String::new(),
            is_active: false,
            is_enabled: true,
        }
    }
}

impl SimRecord {
    /// Whether this SIM can carry an outbound SMS right now.
    pub fn can_send(&self) -> bool {
        self.is_active && self.is_enabled && self.signal_strength > 0
    }
}

/// A gateway device as the store knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_name: String,
    /// Secret the device presents in its `auth` message.
    #[serde(skip_serializing)]
    pub connect_key: String,
    pub model: String,
    pub android_version: String,
    pub app_version: String,
    pub is_active: bool,
    pub is_available: bool,
    pub operator_status: OperatorStatus,
    /// 0–100.
    pub battery_level: u8,
    pub battery_status: String,
    pub signal_strength: i32,
    /// Unix ms of the last authenticated frame or report.
    pub last_seen: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub location: String,
    pub site: Option<SiteInfo>,
    pub group: Option<GroupInfo>,
    pub sims: Vec<SimRecord>,
}

impl Default for DeviceRecord {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            device_name: String::new(),
            connect_key: String::new(),
            model: String::new(),
            android_version: String::new(),
            app_version: String::new(),
            is_active: true,
            is_available: false,
            operator_status: OperatorStatus::Offline,
            battery_level: 0,
            battery_status: String::new(),
            signal_strength: 0,
            last_seen: 0,
            latitude: 0.0,
            longitude: 0.0,
            location: String::new(),
            site: None,
            group: None,
            sims: Vec::new(),
        }
    }
}

impl DeviceRecord {
    pub fn site_name(&self) -> &str {
        self.site.as_ref().map_or("", |s| s.name.as_str())
    }

    pub fn group_name(&self) -> &str {
        self.group.as_ref().map_or("", |g| g.name.as_str())
    }

    pub fn country(&self) -> Option<&str> {
        self.site.as_ref().map(|s| s.country.as_str())
    }

    pub fn operator(&self) -> Option<&str> {
        self.group.as_ref().map(|g| g.operator.as_str())
    }

    /// Active, available, operator link online, and battery at or above
    /// `min_battery`.
    pub fn is_ready_for_sms(&self, min_battery: u8) -> bool {
        self.is_active
            && self.is_available
            && self.operator_status == OperatorStatus::Online
            && self.battery_level >= min_battery
    }
}

/// Partial update applied to a [`DeviceRecord`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub device_name: Option<String>,
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub app_version: Option<String>,
    pub is_active: Option<bool>,
    pub battery_level: Option<u8>,
    pub battery_status: Option<String>,
    pub signal_strength: Option<i32>,
    pub operator_status: Option<OperatorStatus>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub last_seen: Option<u64>,
}

impl DeviceUpdate {
    pub fn apply(self, device: &mut DeviceRecord) {
        if let Some(v) = self.device_name {
            device.device_name = v;
        }
        if let Some(v) = self.model {
            device.model = v;
        }
        if let Some(v) = self.android_version {
            device.android_version = v;
        }
        if let Some(v) = self.app_version {
            device.app_version = v;
        }
        if let Some(v) = self.is_active {
            device.is_active = v;
        }
        if let Some(v) = self.battery_level {
            device.battery_level = v;
        }
        if let Some(v) = self.battery_status {
            device.battery_status = v;
        }
        if let Some(v) = self.signal_strength {
            device.signal_strength = v;
        }
        if let Some(v) = self.operator_status {
            device.operator_status = v;
        }
        if let Some(v) = self.latitude {
            device.latitude = v;
        }
        if let Some(v) = self.longitude {
            device.longitude = v;
        }
        if let Some(v) = self.last_seen {
            device.last_seen = v;
        }
    }
}

/// Partial update applied to one SIM.
#[derive(Debug, Clone, Default)]
pub struct SimUpdate {
    pub phone_number: Option<String>,
    pub is_enabled: Option<bool>,
}

impl SimUpdate {
    pub fn apply(self, sim: &mut SimRecord) {
        if let Some(v) = self.phone_number {
            sim.phone_number = v;
        }
        if let Some(v) = self.is_enabled {
            sim.is_enabled = v;
        }
    }
}

/// One telemetry sample, appended per registration/status message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub battery_level: u8,
    pub battery_status: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Device-reported timestamp.
    pub timestamp: i64,
    pub recorded_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingSmsRecord {
    pub id: u64,
    pub device_id: String,
    pub from: String,
    pub message: String,
    pub timestamp: i64,
    pub received_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSource {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmRecord {
    pub id: u64,
    pub device_id: String,
    pub source: AlarmSource,
    pub alarm_type: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub resolved: bool,
    pub timestamp: i64,
}

/// What kind of command a [`PendingCommand`] tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Sms,
    Ussd,
    PhoneDiscovery,
}

/// Kind-specific command parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandDetail {
    Sms {
        target: String,
        message: String,
        sim_slot: u32,
    },
    Ussd {
        ussd_code: String,
        sim_slot: u32,
    },
    PhoneDiscovery {
        ussd_code: String,
        sim_slot: u32,
    },
}

impl CommandDetail {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Sms { .. } => CommandKind::Sms,
            Self::Ussd { .. } => CommandKind::Ussd,
            Self::PhoneDiscovery { .. } => CommandKind::PhoneDiscovery,
        }
    }

    pub fn sim_slot(&self) -> u32 {
        match self {
            Self::Sms { sim_slot, .. }
            | Self::Ussd { sim_slot, .. }
            | Self::PhoneDiscovery { sim_slot, .. } => *sim_slot,
        }
    }
}

/// Lifecycle of an outbound command: `pending → sent → {delivered | failed}`.
///
/// `pending` may jump straight to a terminal state when the result races the
/// sent confirmation. Terminal states absorb every later update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl CommandState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Sent | Self::Delivered | Self::Failed)
            | (Self::Sent, Self::Delivered | Self::Failed) => true,
            _ => false,
        }
    }
}

/// An outbound command tracked until its result or delivery report arrives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingCommand {
    pub device_id: String,
    pub internal_log_id: InternalLogId,
    pub detail: CommandDetail,
    pub state: CommandState,
    pub created_at: u64,
    pub sent_at: Option<u64>,
    pub completed_at: Option<u64>,
    /// USSD response text or discovered phone number.
    pub result: Option<String>,
    pub delivery_report: Option<String>,
    pub error_message: Option<String>,
}

impl PendingCommand {
    pub fn new(
        device_id: impl Into<String>,
        internal_log_id: InternalLogId,
        detail: CommandDetail,
        now: u64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            internal_log_id,
            detail,
            state: CommandState::Pending,
            created_at: now,
            sent_at: None,
            completed_at: None,
            result: None,
            delivery_report: None,
            error_message: None,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.detail.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use CommandState::{Delivered, Failed, Pending, Sent};
        assert!(Pending.can_transition_to(Sent));
        assert!(Pending.can_transition_to(Failed));
        assert!(Sent.can_transition_to(Delivered));
        assert!(!Sent.can_transition_to(Pending));
        assert!(!Sent.can_transition_to(Sent));
        assert!(!Delivered.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Delivered));
        assert!(Delivered.is_terminal() && Failed.is_terminal());
        assert!(!Pending.is_terminal() && !Sent.is_terminal());
    }

    #[test]
    fn test_readiness_requires_every_flag() {
        let ready = DeviceRecord {
            device_id: "DEV1".into(),
            is_active: true,
            is_available: true,
            operator_status: OperatorStatus::Online,
            battery_level: 10,
            ..DeviceRecord::default()
        };
        assert!(ready.is_ready_for_sms(10));
        assert!(!ready.is_ready_for_sms(11));
        assert!(!DeviceRecord {
            operator_status: OperatorStatus::Connecting,
            ..ready.clone()
        }
        .is_ready_for_sms(10));
        assert!(!DeviceRecord {
            is_available: false,
            ..ready
        }
        .is_ready_for_sms(10));
    }

    #[test]
    fn test_seed_toml_deserializes_device_with_sims() {
        let device: DeviceRecord = toml::from_str(
            r#"
            device_id = "DEV1"
            connect_key = "K1"
            is_available = true
            operator_status = "online"
            battery_level = 80
            site = { name = "Istanbul-1", country = "TR" }
            group = { name = "Rack A", operator = "Turkcell" }

            [[sims]]
            slot = 0
            identifier = "0"
            is_active = true
            signal_strength = 3
            "#,
        )
        .unwrap();
        assert_eq!(device.connect_key, "K1");
        assert!(device.is_active);
        assert_eq!(device.country(), Some("TR"));
        assert_eq!(device.sims.len(), 1);
        assert!(device.sims[0].is_enabled);
        assert!(device.sims[0].can_send());
    }

    #[test]
    fn test_connect_key_never_serialized() {
        let device = DeviceRecord {
            connect_key: "secret".into(),
            ..DeviceRecord::default()
        };
        let json = serde_json::to_string(&device).unwrap();
        assert!(!json.contains("secret"));
    }
}
