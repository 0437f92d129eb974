//! Process-resident state cache: last-known telemetry and metadata per device/module
//!
//! Keyed by `(deviceId, moduleIndex)` for telemetry and `deviceId` for
//! metadata, per the data model. The cache is the only shared mutable state
//! in the pipeline, so every accessor that needs to diff incoming data
//! against history takes a closure: the read and the write happen under one
//! lock, which is what keeps the normalizer's diff-then-replace sequence
//! (RFID snapshot atomicity, metadata change detection) race-free without
//! the caller having to reason about lock scopes itself.
//!
//! Entries are volatile — nothing here survives a process restart;
//! persistence is the Storage Writer's job.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One RFID slot's last-known occupant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfidTag {
    pub sensor_index: u32,
    pub tag_id: Option<String>,
    pub is_alarm: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempHumReading {
    pub sensor_index: u32,
    pub temp: f64,
    pub hum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseReading {
    pub sensor_index: u32,
    pub noise: f64,
}

/// Telemetry cache entry for one `(deviceId, moduleIndex)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryEntry {
    pub temp_hum: Vec<TempHumReading>,
    pub noise: Vec<NoiseReading>,
    pub rfid_snapshot: Vec<RfidTag>,
    pub door_state: Option<u8>,
    pub door1_state: Option<u8>,
    pub door2_state: Option<u8>,
    pub is_online: bool,
    pub last_seen_hb: Option<DateTime<Utc>>,
    pub last_seen_th: Option<DateTime<Utc>>,
    pub last_seen_ns: Option<DateTime<Utc>>,
    pub last_seen_rfid: Option<DateTime<Utc>>,
    pub last_seen_door: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub module_index: u32,
    pub module_id: String,
    pub u_total: Option<u32>,
    pub fw_ver: Option<String>,
}

/// Metadata cache entry for one `deviceId`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub device_type: String,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub fw_ver: Option<String>,
    pub mask: Option<String>,
    pub gw_ip: Option<String>,
    pub active_modules: Vec<ModuleInfo>,
    pub last_seen_info: Option<DateTime<Utc>>,
}

impl DeviceMetadata {
    /// Find (or make room for) the module at `module_index`, replacing it in
    /// place if found per the "keyed by moduleIndex" merge invariant.
    pub fn module_mut(&mut self, module_index: u32) -> Option<&mut ModuleInfo> {
        self.active_modules
            .iter_mut()
            .find(|m| m.module_index == module_index)
    }
}

/// Telemetry cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TelemetryKey {
    pub device_id: String,
    pub module_index: u32,
}

/// Process-wide state cache, passed as an explicit `Arc` collaborator to
/// every component that needs it (ingress and command service do not).
pub struct StateCache {
    telemetry: DashMap<TelemetryKey, Mutex<TelemetryEntry>>,
    metadata: DashMap<String, Mutex<DeviceMetadata>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self {
            telemetry: DashMap::new(),
            metadata: DashMap::new(),
        }
    }

    /// Take a cloned snapshot of a telemetry entry, creating a default one
    /// if this is the first time the key has been seen.
    pub fn telemetry_snapshot(&self, device_id: &str, module_index: u32) -> TelemetryEntry {
        let key = TelemetryKey {
            device_id: device_id.to_string(),
            module_index,
        };
        self.telemetry
            .entry(key)
            .or_default()
            .lock()
            .clone()
    }

    /// Read, mutate and write a telemetry entry atomically. `f` receives the
    /// entry as it stood at lock-acquisition time and returns whatever the
    /// caller needs derived from the before/after comparison (e.g. a diff).
    pub fn with_telemetry_mut<F, R>(&self, device_id: &str, module_index: u32, f: F) -> R
    where
        F: FnOnce(&mut TelemetryEntry) -> R,
    {
        let key = TelemetryKey {
            device_id: device_id.to_string(),
            module_index,
        };
        let entry = self.telemetry.entry(key).or_default();
        let mut guard = entry.lock();
        f(&mut guard)
    }

    pub fn metadata_snapshot(&self, device_id: &str) -> Option<DeviceMetadata> {
        self.metadata.get(device_id).map(|e| e.lock().clone())
    }

    /// Read, mutate and write a metadata entry atomically, creating a
    /// default entry (stamped with `device_type`) on first contact.
    pub fn with_metadata_mut<F, R>(&self, device_id: &str, device_type: &str, f: F) -> R
    where
        F: FnOnce(&mut DeviceMetadata) -> R,
    {
        let entry = self.metadata.entry(device_id.to_string()).or_insert_with(|| {
            Mutex::new(DeviceMetadata {
                device_type: device_type.to_string(),
                ..Default::default()
            })
        });
        let mut guard = entry.lock();
        f(&mut guard)
    }

    /// All telemetry keys currently tracked, for the watchdog's liveness scan.
    pub fn telemetry_keys(&self) -> Vec<TelemetryKey> {
        self.telemetry.iter().map(|e| e.key().clone()).collect()
    }

    /// All device ids currently tracked in metadata.
    pub fn device_ids(&self) -> Vec<String> {
        self.metadata.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}
