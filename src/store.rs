//! Persistence collaborator.
//!
//! The hub reads devices and SIMs, patches telemetry, appends history and
//! tracks pending commands through the [`Store`] trait. It never locks store
//! state itself: concurrent writers rely on the store's own consistency and
//! last-write-wins is acceptable.
//!
//! [`MemoryStore`] is the bundled implementation, optionally seeded from a
//! TOML file of `[[devices]]`.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::auth::constant_time_eq;
use crate::models::{
    AlarmRecord, DeviceRecord, DeviceUpdate, IncomingSmsRecord, InternalLogId, PendingCommand,
    SimRecord, SimUpdate, TelemetryRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// External persistence for devices, SIMs, history and pending commands.
#[async_trait]
pub trait Store: Send + Sync {
    /// Device whose connect key matches `key`, if any.
    async fn device_by_connect_key(&self, key: &str) -> Result<Option<DeviceRecord>, StoreError>;

    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError>;

    /// All devices with their SIM inventories, in stored order.
    async fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError>;

    async fn update_device(&self, device_id: &str, update: DeviceUpdate)
        -> Result<(), StoreError>;

    /// Replace the whole SIM inventory of a device. Slots are renumbered by
    /// position; the `is_enabled` flag of a SIM with the same identifier
    /// carries over.
    async fn replace_sims(&self, device_id: &str, sims: Vec<SimRecord>) -> Result<(), StoreError>;

    async fn update_sim(
        &self,
        device_id: &str,
        slot: u32,
        update: SimUpdate,
    ) -> Result<(), StoreError>;

    async fn insert_telemetry(&self, record: TelemetryRecord) -> Result<(), StoreError>;

    /// Persist an incoming SMS and return its assigned id.
    async fn insert_incoming_sms(&self, record: IncomingSmsRecord) -> Result<u64, StoreError>;

    /// Persist an alarm and return its assigned id.
    async fn insert_alarm(&self, record: AlarmRecord) -> Result<u64, StoreError>;

    /// Fails with [`StoreError::Conflict`] when `(device_id, internal_log_id)`
    /// is already tracked.
    async fn insert_command(&self, command: PendingCommand) -> Result<(), StoreError>;

    async fn command(
        &self,
        device_id: &str,
        internal_log_id: InternalLogId,
    ) -> Result<Option<PendingCommand>, StoreError>;

    /// Overwrite an existing command.
    async fn save_command(&self, command: PendingCommand) -> Result<(), StoreError>;
}

/// Seed file layout: `[[devices]]` tables with nested `[[devices.sims]]`.
#[derive(Debug, Default, Deserialize)]
struct Seed {
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

#[derive(Default)]
struct Tables {
    devices: Vec<DeviceRecord>,
    telemetry: Vec<TelemetryRecord>,
    incoming_sms: Vec<IncomingSmsRecord>,
    alarms: Vec<AlarmRecord>,
    commands: Vec<PendingCommand>,
}

impl Tables {
    fn device_mut(&mut self, device_id: &str) -> Result<&mut DeviceRecord, StoreError> {
        self.devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
            .ok_or_else(|| StoreError::NotFound(format!("device {device_id}")))
    }
}

/// In-process [`Store`] backed by a single `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<DeviceRecord>) -> Self {
        let devices = devices.into_iter().map(renumber_slots).collect();
        Self {
            tables: RwLock::new(Tables {
                devices,
                ..Tables::default()
            }),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn from_seed_str(toml_str: &str) -> Result<Self, toml::de::Error> {
        let seed: Seed = toml::from_str(toml_str)?;
        Ok(Self::with_devices(seed.devices))
    }

    pub fn from_seed_file(path: &Path) -> Result<Self, crate::config::ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| crate::config::ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_seed_str(&contents).map_err(|source| crate::config::ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub async fn telemetry(&self, device_id: &str) -> Vec<TelemetryRecord> {
        let tables = self.tables.read().await;
        tables
            .telemetry
            .iter()
            .filter(|t| t.device_id == device_id)
            .cloned()
            .collect()
    }

    pub async fn incoming_sms(&self) -> Vec<IncomingSmsRecord> {
        self.tables.read().await.incoming_sms.clone()
    }

    pub async fn alarms(&self) -> Vec<AlarmRecord> {
        self.tables.read().await.alarms.clone()
    }

    pub async fn commands(&self) -> Vec<PendingCommand> {
        self.tables.read().await.commands.clone()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn renumber_slots(mut device: DeviceRecord) -> DeviceRecord {
    for (i, sim) in device.sims.iter_mut().enumerate() {
        sim.slot = u32::try_from(i).unwrap_or(u32::MAX);
    }
    device
}

#[async_trait]
impl Store for MemoryStore {
    async fn device_by_connect_key(&self, key: &str) -> Result<Option<DeviceRecord>, StoreError> {
        if key.is_empty() {
            return Ok(None);
        }
        let tables = self.tables.read().await;
        // Compare against every device so lookup time does not depend on position.
        let mut found = None;
        for device in &tables.devices {
            if constant_time_eq(device.connect_key.as_bytes(), key.as_bytes()) && found.is_none() {
                found = Some(device.clone());
            }
        }
        Ok(found)
    }

    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .devices
            .iter()
            .find(|d| d.device_id == device_id)
            .cloned())
    }

    async fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.tables.read().await.devices.clone())
    }

    async fn update_device(
        &self,
        device_id: &str,
        update: DeviceUpdate,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        update.apply(tables.device_mut(device_id)?);
        Ok(())
    }

    async fn replace_sims(&self, device_id: &str, sims: Vec<SimRecord>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let device = tables.device_mut(device_id)?;
        let previous = std::mem::take(&mut device.sims);
        device.sims = sims
            .into_iter()
            .enumerate()
            .map(|(i, mut sim)| {
                sim.slot = u32::try_from(i).unwrap_or(u32::MAX);
                if let Some(old) = previous
                    .iter()
                    .find(|p| !p.identifier.is_empty() && p.identifier == sim.identifier)
                {
                    sim.is_enabled = old.is_enabled;
                    if sim.phone_number.is_empty() {
                        sim.phone_number.clone_from(&old.phone_number);
                    }
                }
                sim
            })
            .collect();
        Ok(())
    }

    async fn update_sim(
        &self,
        device_id: &str,
        slot: u32,
        update: SimUpdate,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let device = tables.device_mut(device_id)?;
        let sim = device
            .sims
            .iter_mut()
            .find(|s| s.slot == slot)
            .ok_or_else(|| StoreError::NotFound(format!("sim {slot} on {device_id}")))?;
        update.apply(sim);
        Ok(())
    }

    async fn insert_telemetry(&self, record: TelemetryRecord) -> Result<(), StoreError> {
        self.tables.write().await.telemetry.push(record);
        Ok(())
    }

    async fn insert_incoming_sms(&self, mut record: IncomingSmsRecord) -> Result<u64, StoreError> {
        let id = self.next_id();
        record.id = id;
        self.tables.write().await.incoming_sms.push(record);
        Ok(id)
    }

    async fn insert_alarm(&self, mut record: AlarmRecord) -> Result<u64, StoreError> {
        let id = self.next_id();
        record.id = id;
        self.tables.write().await.alarms.push(record);
        Ok(id)
    }

    async fn insert_command(&self, command: PendingCommand) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.commands.iter().any(|c| {
            c.device_id == command.device_id && c.internal_log_id == command.internal_log_id
        }) {
            return Err(StoreError::Conflict(format!(
                "command {} on {}",
                command.internal_log_id, command.device_id
            )));
        }
        tables.commands.push(command);
        Ok(())
    }

    async fn command(
        &self,
        device_id: &str,
        internal_log_id: InternalLogId,
    ) -> Result<Option<PendingCommand>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .commands
            .iter()
            .find(|c| c.device_id == device_id && c.internal_log_id == internal_log_id)
            .cloned())
    }

    async fn save_command(&self, command: PendingCommand) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .commands
            .iter_mut()
            .find(|c| {
                c.device_id == command.device_id && c.internal_log_id == command.internal_log_id
            })
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "command {} on {}",
                    command.internal_log_id, command.device_id
                ))
            })?;
        *slot = command;
        Ok(())
    }
}
