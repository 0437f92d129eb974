//! The central stateful stage: SIF in, SUO out, State Cache in between
//!
//! This is the most complex component in the pipeline — it is also the
//! only one that must serialize work per `deviceId`, since every handler
//! below reads a cache entry and writes it back based on what it read
//! (RFID diffing, metadata change detection). Two SIFs for the same device
//! processed out of order would corrupt that diff, so incoming SIFs are
//! hash-partitioned by `deviceId` across a small worker pool: each worker
//! owns a disjoint subset of devices and processes its queue strictly in
//! order, while distinct devices still proceed in parallel.
//!
//! The handler functions themselves (`handle_*`, `diff_rfid`, `merge_modules`)
//! are plain, synchronous and cache-only, which is what makes them cheap to
//! unit test without standing up the bus or an async runtime.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use xxhash_rust::xxh64::xxh64;

use crate::bus::EventBus;
use crate::cache::{DeviceMetadata, ModuleInfo, RfidTag, StateCache};
use crate::common::shutdown::ShutdownReceiver;
use crate::common::{AtomicCounters, MiddlewareResult};
use crate::model::{CommandRequest, CommandType, MessageType, ProtocolFamily, Sif, Suo};

/// What one SIF turns into: zero or more canonical events, plus zero or
/// more outbound command requests (event-only protocols resync via a
/// command rather than a direct cache update).
#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    pub suos: Vec<Suo>,
    pub commands: Vec<CommandRequest>,
}

fn assign_message_id(existing: &Option<String>, counter: &AtomicU64) -> String {
    existing.clone().unwrap_or_else(|| {
        let n = counter.fetch_add(1, Ordering::Relaxed);
        format!("auto-{n}")
    })
}

fn is_v5008(sif: &Sif) -> bool {
    sif.device_type == "V5008"
}

/// Groups a SIF's sensor payload by module. V6800 SIFs already nest a
/// per-module nested `data` array (`{moduleIndex, data:[...]}`); V5008
/// temp/hum and noise frames carry a flat device-wide sensor list with no
/// module concept of their own, so they're treated as addressing a single
/// virtual module (index 1) — this cabinet-as-one-module assumption is
/// recorded as a resolved open question in the design notes.
fn group_sensor_entries(sif: &Sif) -> Vec<(u32, Vec<Value>)> {
    let nested = sif
        .data
        .iter()
        .any(|e| e.get("moduleIndex").is_some() && e.get("data").is_some());
    if nested {
        sif.data
            .iter()
            .map(|entry| {
                let idx = entry.get("moduleIndex").and_then(Value::as_u64).unwrap_or(1) as u32;
                let sensors = entry.get("data").and_then(Value::as_array).cloned().unwrap_or_default();
                (idx, sensors)
            })
            .collect()
    } else {
        vec![(sif.module_index.unwrap_or(1), sif.data.clone())]
    }
}

fn handle_temp_hum(sif: &Sif, cache: &StateCache, counter: &AtomicU64) -> Vec<Suo> {
    let mut suos = Vec::new();
    for (module_index, sensors) in group_sensor_entries(sif) {
        let readings: Vec<crate::cache::TempHumReading> = sensors
            .iter()
            .filter_map(|s| {
                let sensor_index = s.get("thIndex").and_then(Value::as_u64)? as u32;
                let temp = s.get("temp").and_then(Value::as_f64)?;
                let hum = s.get("hum").and_then(Value::as_f64)?;
                Some(crate::cache::TempHumReading { sensor_index, temp, hum })
            })
            .collect();
        if readings.is_empty() {
            continue;
        }
        cache.with_telemetry_mut(&sif.device_id, module_index, |entry| {
            entry.temp_hum = readings.clone();
            entry.last_seen_th = Some(Utc::now());
        });
        let payload = readings
            .iter()
            .map(|r| json!({"sensorIndex": r.sensor_index, "temp": r.temp, "hum": r.hum}))
            .collect();
        let mut suo = Suo::new(
            MessageType::TempHum,
            assign_message_id(&sif.message_id, counter),
            sif.device_id.clone(),
            sif.device_type.clone(),
        );
        suo.module_index = Some(module_index);
        suo.payload = payload;
        suos.push(suo);
    }
    suos
}

fn handle_noise(sif: &Sif, cache: &StateCache, counter: &AtomicU64) -> Vec<Suo> {
    let mut suos = Vec::new();
    for (module_index, sensors) in group_sensor_entries(sif) {
        let readings: Vec<crate::cache::NoiseReading> = sensors
            .iter()
            .filter_map(|s| {
                let sensor_index = s.get("nsIndex").and_then(Value::as_u64)? as u32;
                let noise = s.get("noise").and_then(Value::as_f64)?;
                Some(crate::cache::NoiseReading { sensor_index, noise })
            })
            .collect();
        if readings.is_empty() {
            continue;
        }
        cache.with_telemetry_mut(&sif.device_id, module_index, |entry| {
            entry.noise = readings.clone();
            entry.last_seen_ns = Some(Utc::now());
        });
        let payload = readings
            .iter()
            .map(|r| json!({"sensorIndex": r.sensor_index, "noise": r.noise}))
            .collect();
        let mut suo = Suo::new(
            MessageType::NoiseLevel,
            assign_message_id(&sif.message_id, counter),
            sif.device_id.clone(),
            sif.device_type.clone(),
        );
        suo.module_index = Some(module_index);
        suo.payload = payload;
        suos.push(suo);
    }
    suos
}

fn handle_door_state(sif: &Sif, cache: &StateCache, counter: &AtomicU64) -> Vec<Suo> {
    let module_index = sif.module_index.unwrap_or(1);
    let door_state = sif.extra_u64("doorState").map(|v| v as u8);
    let door1 = sif.extra_u64("door1State").map(|v| v as u8);
    let door2 = sif.extra_u64("door2State").map(|v| v as u8);

    cache.with_telemetry_mut(&sif.device_id, module_index, |entry| {
        if let Some(d) = door_state {
            entry.door_state = Some(d);
        }
        if let Some(d) = door1 {
            entry.door1_state = Some(d);
        }
        if let Some(d) = door2 {
            entry.door2_state = Some(d);
        }
        entry.last_seen_door = Some(Utc::now());
    });

    let mut payload_obj = serde_json::Map::new();
    if let Some(d) = door_state {
        payload_obj.insert("doorState".to_string(), Value::from(d));
    }
    if let Some(d) = door1 {
        payload_obj.insert("door1State".to_string(), Value::from(d));
    }
    if let Some(d) = door2 {
        payload_obj.insert("door2State".to_string(), Value::from(d));
    }
    if payload_obj.is_empty() {
        return Vec::new();
    }

    let mut suo = Suo::new(
        sif.message_type,
        assign_message_id(&sif.message_id, counter),
        sif.device_id.clone(),
        sif.device_type.clone(),
    );
    suo.module_index = Some(module_index);
    suo.payload = vec![Value::Object(payload_obj)];
    vec![suo]
}

/// RFID diff action. Ordering matters: ties on `sensorIndex` break by this
/// precedence, not insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfidAction {
    Detached,
    Attached,
    AlarmOn,
    AlarmOff,
}

impl RfidAction {
    fn precedence(self) -> u8 {
        match self {
            RfidAction::Detached => 0,
            RfidAction::Attached => 1,
            RfidAction::AlarmOn => 2,
            RfidAction::AlarmOff => 3,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            RfidAction::Detached => "DETACHED",
            RfidAction::Attached => "ATTACHED",
            RfidAction::AlarmOn => "ALARM_ON",
            RfidAction::AlarmOff => "ALARM_OFF",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RfidDiffEvent {
    pub sensor_index: u32,
    pub tag_id: Option<String>,
    pub action: RfidAction,
}

/// Symmetric diff of two RFID snapshots keyed by `sensorIndex`, kept as a
/// pure function independent of the cache for direct testing.
pub fn diff_rfid(prev: &[RfidTag], curr: &[RfidTag]) -> Vec<RfidDiffEvent> {
    let prev_map: BTreeMap<u32, &RfidTag> = prev.iter().map(|t| (t.sensor_index, t)).collect();
    let curr_map: BTreeMap<u32, &RfidTag> = curr.iter().map(|t| (t.sensor_index, t)).collect();
    let indices: BTreeSet<u32> = prev_map.keys().chain(curr_map.keys()).copied().collect();

    let mut events = Vec::new();
    for idx in indices {
        match (prev_map.get(&idx), curr_map.get(&idx)) {
            (Some(p), Some(c)) => {
                if p.tag_id != c.tag_id {
                    events.push(RfidDiffEvent {
                        sensor_index: idx,
                        tag_id: p.tag_id.clone(),
                        action: RfidAction::Detached,
                    });
                    events.push(RfidDiffEvent {
                        sensor_index: idx,
                        tag_id: c.tag_id.clone(),
                        action: RfidAction::Attached,
                    });
                } else if p.is_alarm != c.is_alarm {
                    let action = if c.is_alarm { RfidAction::AlarmOn } else { RfidAction::AlarmOff };
                    events.push(RfidDiffEvent {
                        sensor_index: idx,
                        tag_id: c.tag_id.clone(),
                        action,
                    });
                }
            }
            (Some(p), None) => events.push(RfidDiffEvent {
                sensor_index: idx,
                tag_id: p.tag_id.clone(),
                action: RfidAction::Detached,
            }),
            (None, Some(c)) => events.push(RfidDiffEvent {
                sensor_index: idx,
                tag_id: c.tag_id.clone(),
                action: RfidAction::Attached,
            }),
            (None, None) => unreachable!("index came from one of the two maps"),
        }
    }
    events.sort_by_key(|e| (e.sensor_index, e.action.precedence()));
    events
}

/// Parses one module's raw tag entries (`{uIndex,tagId,isAlarm}`) into
/// `RfidTag`s. Shared by the flat V5008 shape and the per-module V6800
/// nested shape via [`group_sensor_entries`].
fn parse_rfid_tags(entries: &[Value]) -> Vec<RfidTag> {
    entries
        .iter()
        .filter_map(|e| {
            let sensor_index = e.get("uIndex").and_then(Value::as_u64)? as u32;
            let tag_id = e.get("tagId").and_then(Value::as_str).map(str::to_string);
            let is_alarm = e.get("isAlarm").and_then(Value::as_bool).unwrap_or(false);
            Some(RfidTag { sensor_index, tag_id, is_alarm })
        })
        .collect()
}

/// A snapshot can arrive flat (V5008, one virtual module) or nested per
/// module (V6800's `[{moduleIndex, data:[...]}]`); both shapes are split
/// into `(moduleIndex, tags)` pairs by [`group_sensor_entries`] and handled
/// identically from here, including diffing each module's tags against its
/// own cache entry.
fn handle_rfid_snapshot(sif: &Sif, cache: &StateCache, counter: &AtomicU64) -> Vec<Suo> {
    let mut suos = Vec::new();
    for (module_index, entries) in group_sensor_entries(sif) {
        let incoming = parse_rfid_tags(&entries);

        let diff = cache.with_telemetry_mut(&sif.device_id, module_index, |entry| {
            let diff = diff_rfid(&entry.rfid_snapshot, &incoming);
            entry.rfid_snapshot = incoming.clone();
            entry.last_seen_rfid = Some(Utc::now());
            diff
        });

        if !diff.is_empty() {
            let payload = diff
                .iter()
                .map(|e| json!({"sensorIndex": e.sensor_index, "tagId": e.tag_id, "action": e.action.as_str()}))
                .collect();
            let mut event_suo = Suo::new(
                MessageType::RfidEvent,
                assign_message_id(&sif.message_id, counter),
                sif.device_id.clone(),
                sif.device_type.clone(),
            );
            event_suo.module_index = Some(module_index);
            event_suo.payload = payload;
            suos.push(event_suo);
        }

        let snapshot_payload: Vec<Value> = incoming
            .iter()
            .map(|t| json!({"sensorIndex": t.sensor_index, "tagId": t.tag_id, "isAlarm": t.is_alarm}))
            .collect();
        let mut snap_suo = Suo::new(
            MessageType::RfidSnapshot,
            assign_message_id(&sif.message_id, counter),
            sif.device_id.clone(),
            sif.device_type.clone(),
        );
        snap_suo.module_index = Some(module_index);
        snap_suo.payload = if snapshot_payload.is_empty() {
            vec![json!({})]
        } else {
            snapshot_payload
        };
        suos.push(snap_suo);
    }
    suos
}

fn handle_rfid_event_binary(sif: &Sif, cache: &StateCache, counter: &AtomicU64) -> Vec<Suo> {
    let module_index = sif.module_index.unwrap_or(1);
    let updates: Vec<RfidTag> = sif
        .data
        .iter()
        .filter_map(|e| {
            let sensor_index = e.get("uIndex").and_then(Value::as_u64)? as u32;
            let tag_id = e.get("tagId").and_then(Value::as_str).map(str::to_string);
            let is_alarm = e.get("isAlarm").and_then(Value::as_bool).unwrap_or(false);
            Some(RfidTag { sensor_index, tag_id, is_alarm })
        })
        .collect();
    if updates.is_empty() {
        return Vec::new();
    }

    cache.with_telemetry_mut(&sif.device_id, module_index, |entry| {
        for update in &updates {
            if let Some(existing) = entry
                .rfid_snapshot
                .iter_mut()
                .find(|t| t.sensor_index == update.sensor_index)
            {
                *existing = update.clone();
            } else {
                entry.rfid_snapshot.push(update.clone());
            }
        }
        entry.last_seen_rfid = Some(Utc::now());
    });

    let payload = updates
        .iter()
        .map(|u| json!({"sensorIndex": u.sensor_index, "tagId": u.tag_id, "isAlarm": u.is_alarm}))
        .collect();
    let mut suo = Suo::new(
        MessageType::RfidEvent,
        assign_message_id(&sif.message_id, counter),
        sif.device_id.clone(),
        sif.device_type.clone(),
    );
    suo.module_index = Some(module_index);
    suo.payload = payload;
    vec![suo]
}

fn handle_rfid_event_json(sif: &Sif) -> Vec<CommandRequest> {
    let module_indices: Vec<u32> = if sif.data.iter().any(|e| e.get("moduleIndex").is_some()) {
        sif.data
            .iter()
            .filter_map(|e| e.get("moduleIndex").and_then(Value::as_u64))
            .map(|v| v as u32)
            .collect()
    } else {
        vec![sif.module_index.unwrap_or(1)]
    };
    module_indices
        .into_iter()
        .map(|idx| CommandRequest {
            command_type: CommandType::QryRfidSnapshot,
            protocol_family: ProtocolFamily::V6800,
            device_id: sif.device_id.clone(),
            module_index: Some(idx),
            params: Value::Null,
        })
        .collect()
}

/// Device-level metadata fields that generate a one-line change
/// description when they differ from the cache.
#[derive(Debug, Default)]
struct DeviceFieldUpdate {
    ip: Option<String>,
    mac: Option<String>,
    fw_ver: Option<String>,
    mask: Option<String>,
    gw_ip: Option<String>,
}

fn diff_device_fields(meta: &mut DeviceMetadata, update: &DeviceFieldUpdate) -> Vec<String> {
    let mut changes = Vec::new();

    macro_rules! check_field {
        ($field:ident, $label:literal) => {
            if let Some(new_val) = &update.$field {
                if meta.$field.as_deref() != Some(new_val.as_str()) {
                    changes.push(format!(
                        "{} changed: {} → {}",
                        $label,
                        meta.$field.clone().unwrap_or_else(|| "none".to_string()),
                        new_val
                    ));
                    meta.$field = Some(new_val.clone());
                }
            }
        };
    }
    check_field!(ip, "ip");
    check_field!(mac, "mac");
    check_field!(fw_ver, "fwVer");
    check_field!(mask, "mask");
    check_field!(gw_ip, "gwIp");
    changes
}

/// Merges incoming module entries into cached `activeModules`, keyed by
/// `moduleIndex`. Removal only happens for a full snapshot, per the
/// invariant that incremental messages (HEARTBEAT, UTOTAL_CHANGED) never
/// implicitly drop a module the device simply didn't mention this time.
fn merge_modules(meta: &mut DeviceMetadata, incoming: &[ModuleInfo], is_full_snapshot: bool) -> Vec<String> {
    let mut changes = Vec::new();
    for m in incoming {
        if let Some(existing) = meta.module_mut(m.module_index) {
            if existing.module_id != m.module_id && !m.module_id.is_empty() {
                changes.push(format!(
                    "module {} replaced: {} → {}",
                    m.module_index, existing.module_id, m.module_id
                ));
                existing.module_id = m.module_id.clone();
            }
            if m.u_total.is_some() && existing.u_total != m.u_total {
                changes.push(format!(
                    "module {} uTotal changed: {:?} → {:?}",
                    m.module_index, existing.u_total, m.u_total
                ));
                existing.u_total = m.u_total;
            }
            if m.fw_ver.is_some() && existing.fw_ver != m.fw_ver {
                changes.push(format!(
                    "module {} fwVer changed: {:?} → {:?}",
                    m.module_index, existing.fw_ver, m.fw_ver
                ));
                existing.fw_ver = m.fw_ver.clone();
            }
        } else {
            changes.push(format!("module {} added: {}", m.module_index, m.module_id));
            meta.active_modules.push(m.clone());
        }
    }

    if is_full_snapshot {
        let incoming_indices: BTreeSet<u32> = incoming.iter().map(|m| m.module_index).collect();
        for removed in meta
            .active_modules
            .iter()
            .map(|m| m.module_index)
            .filter(|idx| !incoming_indices.contains(idx))
            .collect::<Vec<_>>()
        {
            changes.push(format!("module {removed} removed"));
        }
        meta.active_modules.retain(|m| incoming_indices.contains(&m.module_index));
    }
    changes
}

fn metadata_to_json(meta: &DeviceMetadata) -> Value {
    json!({
        "deviceType": meta.device_type,
        "ip": meta.ip,
        "mac": meta.mac,
        "fwVer": meta.fw_ver,
        "mask": meta.mask,
        "gwIp": meta.gw_ip,
        "activeModules": meta.active_modules.iter().map(|m| json!({
            "moduleIndex": m.module_index,
            "moduleId": m.module_id,
            "uTotal": m.u_total,
            "fwVer": m.fw_ver,
        })).collect::<Vec<_>>(),
    })
}

fn emit_metadata_change(
    sif: &Sif,
    cache: &StateCache,
    counter: &AtomicU64,
    changes: Vec<String>,
    came_online: bool,
) -> Vec<Suo> {
    let mut suos = Vec::new();
    let mut change_suo = Suo::new(
        MessageType::MetaChangedEvent,
        assign_message_id(&sif.message_id, counter),
        sif.device_id.clone(),
        sif.device_type.clone(),
    );
    change_suo.payload = changes.into_iter().map(Value::from).collect();
    suos.push(change_suo);

    if let Some(meta) = cache.metadata_snapshot(&sif.device_id) {
        let mut meta_suo = Suo::new(
            MessageType::DeviceMetadata,
            assign_message_id(&sif.message_id, counter),
            sif.device_id.clone(),
            sif.device_type.clone(),
        );
        let mut payload = metadata_to_json(&meta);
        if came_online {
            payload["isOnline"] = Value::from(true);
        }
        meta_suo.payload = vec![payload];
        suos.push(meta_suo);
    }
    suos
}

/// A device-level DEVICE_METADATA SUO carrying just the reconnect state,
/// for the case where a heartbeat brings a module back online but nothing
/// else about its metadata changed — mirrors the watchdog's symmetric
/// offline transition so both directions of the liveness transition
/// produce the same SUO shape.
fn emit_online_transition(sif: &Sif, cache: &StateCache, counter: &AtomicU64) -> Option<Suo> {
    let meta = cache.metadata_snapshot(&sif.device_id)?;
    let mut suo = Suo::new(
        MessageType::DeviceMetadata,
        assign_message_id(&sif.message_id, counter),
        sif.device_id.clone(),
        sif.device_type.clone(),
    );
    let mut payload = metadata_to_json(&meta);
    payload["isOnline"] = Value::from(true);
    suo.payload = vec![payload];
    Some(suo)
}

fn handle_heartbeat(sif: &Sif, cache: &StateCache, counter: &AtomicU64) -> Vec<Suo> {
    let now = Utc::now();
    let mut modules = Vec::new();
    let mut came_online = false;
    for entry in &sif.data {
        let module_index = match entry.get("moduleIndex").and_then(Value::as_u64) {
            Some(i) => i as u32,
            None => continue,
        };
        let reconnected = cache.with_telemetry_mut(&sif.device_id, module_index, |t| {
            // Only a module that had already sent a heartbeat before and
            // was marked offline counts as a reconnect; a brand-new entry
            // defaults `is_online` to false too, but that's first contact,
            // not a transition, and must not emit a spurious online SUO.
            let reconnected = t.last_seen_hb.is_some() && !t.is_online;
            t.is_online = true;
            t.last_seen_hb = Some(now);
            reconnected
        });
        came_online |= reconnected;
        modules.push(ModuleInfo {
            module_index,
            module_id: entry.get("moduleId").and_then(Value::as_str).unwrap_or_default().to_string(),
            u_total: entry.get("uTotal").and_then(Value::as_u64).map(|v| v as u32),
            fw_ver: entry.get("fwVer").and_then(Value::as_str).map(str::to_string),
        });
    }

    let field_update = DeviceFieldUpdate {
        ip: sif.extra_str("ip").map(str::to_string),
        mac: sif.extra_str("mac").map(str::to_string),
        ..Default::default()
    };

    let changes = cache.with_metadata_mut(&sif.device_id, &sif.device_type, |meta| {
        let mut changes = diff_device_fields(meta, &field_update);
        changes.extend(merge_modules(meta, &modules, false));
        meta.last_seen_info = Some(now);
        changes
    });

    let mut heartbeat_suo = Suo::new(
        MessageType::Heartbeat,
        assign_message_id(&sif.message_id, counter),
        sif.device_id.clone(),
        sif.device_type.clone(),
    );
    heartbeat_suo.payload = modules
        .iter()
        .map(|m| json!({"moduleIndex": m.module_index, "moduleId": m.module_id, "uTotal": m.u_total, "fwVer": m.fw_ver}))
        .collect();
    let mut suos = vec![heartbeat_suo];

    if changes.is_empty() {
        if came_online {
            suos.extend(emit_online_transition(sif, cache, counter));
        }
        return suos;
    }
    suos.extend(emit_metadata_change(sif, cache, counter, changes, came_online));
    suos
}

fn handle_metadata_update(sif: &Sif, cache: &StateCache, counter: &AtomicU64) -> Vec<Suo> {
    let is_full_snapshot = matches!(
        sif.message_type,
        MessageType::DeviceInfo | MessageType::ModuleInfo | MessageType::DevModInfo
    );

    let field_update = DeviceFieldUpdate {
        ip: sif.extra_str("ip").map(str::to_string),
        mac: sif.extra_str("mac").map(str::to_string),
        fw_ver: sif.extra_str("fwVer").map(str::to_string),
        mask: sif.extra_str("mask").map(str::to_string),
        gw_ip: sif.extra_str("gwIp").map(str::to_string),
    };

    let incoming_modules: Vec<ModuleInfo> = sif
        .data
        .iter()
        .filter_map(|e| {
            let module_index = e.get("moduleIndex").and_then(Value::as_u64)? as u32;
            Some(ModuleInfo {
                module_index,
                module_id: e.get("moduleId").and_then(Value::as_str).unwrap_or_default().to_string(),
                u_total: e.get("uTotal").and_then(Value::as_u64).map(|v| v as u32),
                fw_ver: e.get("fwVer").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect();

    let changes = cache.with_metadata_mut(&sif.device_id, &sif.device_type, |meta| {
        let mut changes = diff_device_fields(meta, &field_update);
        changes.extend(merge_modules(meta, &incoming_modules, is_full_snapshot));
        meta.last_seen_info = Some(Utc::now());
        changes
    });

    if changes.is_empty() {
        return Vec::new();
    }
    emit_metadata_change(sif, cache, counter, changes, false)
}

fn handle_command_response(sif: &Sif, counter: &AtomicU64) -> Vec<Suo> {
    let mut payload_obj = serde_json::Map::new();
    for key in ["result", "colorMap", "colorName", "colorCode", "originalReq"] {
        if let Some(v) = sif.extra.get(key) {
            payload_obj.insert(key.to_string(), v.clone());
        }
    }
    let mut suo = Suo::new(
        sif.message_type,
        assign_message_id(&sif.message_id, counter),
        sif.device_id.clone(),
        sif.device_type.clone(),
    );
    suo.payload = vec![Value::Object(payload_obj)];
    vec![suo]
}

/// Normalizes one SIF into zero or more SUOs/commands. Pure aside from the
/// cache and the monotonic id counter it's handed — no bus access, which is
/// what makes this directly unit-testable.
pub fn normalize(sif: &Sif, cache: &StateCache, counter: &AtomicU64) -> NormalizeOutcome {
    match sif.message_type {
        MessageType::TempHum | MessageType::QryTempHumResp => NormalizeOutcome {
            suos: handle_temp_hum(sif, cache, counter),
            commands: Vec::new(),
        },
        MessageType::NoiseLevel => NormalizeOutcome {
            suos: handle_noise(sif, cache, counter),
            commands: Vec::new(),
        },
        MessageType::DoorState | MessageType::QryDoorStateResp => NormalizeOutcome {
            suos: handle_door_state(sif, cache, counter),
            commands: Vec::new(),
        },
        MessageType::RfidSnapshot => NormalizeOutcome {
            suos: handle_rfid_snapshot(sif, cache, counter),
            commands: Vec::new(),
        },
        MessageType::RfidEvent => {
            if is_v5008(sif) {
                NormalizeOutcome {
                    suos: handle_rfid_event_binary(sif, cache, counter),
                    commands: Vec::new(),
                }
            } else {
                NormalizeOutcome {
                    suos: Vec::new(),
                    commands: handle_rfid_event_json(sif),
                }
            }
        }
        MessageType::Heartbeat => NormalizeOutcome {
            suos: handle_heartbeat(sif, cache, counter),
            commands: Vec::new(),
        },
        MessageType::DeviceInfo | MessageType::ModuleInfo | MessageType::DevModInfo | MessageType::UtotalChanged => {
            NormalizeOutcome {
                suos: handle_metadata_update(sif, cache, counter),
                commands: Vec::new(),
            }
        }
        MessageType::QryClrResp | MessageType::SetClrResp | MessageType::ClnAlmResp => NormalizeOutcome {
            suos: handle_command_response(sif, counter),
            commands: Vec::new(),
        },
        MessageType::Unknown | MessageType::DeviceMetadata | MessageType::MetaChangedEvent => {
            NormalizeOutcome::default()
        }
    }
}

fn partition_for(device_id: &str, worker_count: usize) -> usize {
    (xxh64(device_id.as_bytes(), 0) as usize) % worker_count.max(1)
}

/// Hash-partitioned normalizer task. Owns no domain state of its own beyond
/// the monotonic message-id counter — `cache` and `bus` are explicit
/// collaborators shared with every other component.
pub struct Normalizer {
    cache: Arc<StateCache>,
    bus: Arc<EventBus>,
    counter: AtomicU64,
    worker_count: usize,
    metrics: Arc<AtomicCounters>,
}

impl Normalizer {
    pub fn new(cache: Arc<StateCache>, bus: Arc<EventBus>, worker_count: usize) -> Arc<Self> {
        Arc::new(Self {
            cache,
            bus,
            counter: AtomicU64::new(1),
            worker_count: worker_count.max(1),
            metrics: Arc::new(AtomicCounters::new()),
        })
    }

    pub fn metrics(&self) -> &Arc<AtomicCounters> {
        &self.metrics
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: ShutdownReceiver) -> MiddlewareResult<()> {
        let mut senders = Vec::with_capacity(self.worker_count);
        let mut worker_handles = Vec::with_capacity(self.worker_count);
        for _ in 0..self.worker_count {
            let (tx, rx) = mpsc::unbounded_channel::<Arc<Sif>>();
            senders.push(tx);
            let this = Arc::clone(&self);
            worker_handles.push(tokio::spawn(this.worker_loop(rx)));
        }

        let mut parsed_rx = self.bus.subscribe_parsed();
        loop {
            tokio::select! {
                msg = parsed_rx.recv() => {
                    match msg {
                        Ok(sif) => {
                            self.metrics.inc_received();
                            let idx = partition_for(&sif.device_id, self.worker_count);
                            if senders[idx].send(sif).is_err() {
                                self.metrics.inc_dropped();
                                warn!("normalizer worker channel closed unexpectedly");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "normalizer lagged behind data.parsed");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("normalizer shutting down");
                    break;
                }
            }
        }
        drop(senders);
        for handle in worker_handles {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Arc<Sif>>) {
        while let Some(sif) = rx.recv().await {
            let outcome = normalize(&sif, &self.cache, &self.counter);
            self.metrics.inc_processed();
            for suo in outcome.suos {
                self.bus.publish_normalized(suo);
            }
            for cmd in outcome.commands {
                self.bus.publish_command_request(cmd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sif;

    fn tag(sensor_index: u32, tag_id: Option<&str>, is_alarm: bool) -> RfidTag {
        RfidTag {
            sensor_index,
            tag_id: tag_id.map(str::to_string),
            is_alarm,
        }
    }

    #[test]
    fn diff_rfid_detects_attach_and_detach() {
        let prev = vec![tag(1, Some("A"), false)];
        let curr = vec![tag(1, Some("B"), false)];
        let events = diff_rfid(&prev, &curr);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, RfidAction::Detached);
        assert_eq!(events[0].tag_id.as_deref(), Some("A"));
        assert_eq!(events[1].action, RfidAction::Attached);
        assert_eq!(events[1].tag_id.as_deref(), Some("B"));
    }

    #[test]
    fn diff_rfid_detects_alarm_transitions() {
        let prev = vec![tag(2, Some("A"), false)];
        let curr = vec![tag(2, Some("A"), true)];
        let events = diff_rfid(&prev, &curr);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, RfidAction::AlarmOn);
    }

    #[test]
    fn diff_rfid_unchanged_produces_no_events() {
        let snapshot = vec![tag(1, Some("A"), false), tag(2, None, false)];
        assert!(diff_rfid(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn diff_rfid_orders_by_sensor_index_then_precedence() {
        let prev = vec![tag(5, Some("A"), false), tag(1, Some("B"), false)];
        let curr = vec![tag(5, Some("C"), false), tag(1, None, false)];
        let events = diff_rfid(&prev, &curr);
        let indices: Vec<u32> = events.iter().map(|e| e.sensor_index).collect();
        assert_eq!(indices, vec![1, 5, 5]);
    }

    #[test]
    fn rfid_snapshot_is_stored_atomically() {
        let cache = StateCache::new();
        let mut sif = Sif::new("V5008", "dev-1", MessageType::RfidSnapshot);
        sif.data = vec![json!({"uIndex": 1, "tagId": "A", "isAlarm": false})];
        let counter = AtomicU64::new(1);
        let outcome = normalize(&sif, &cache, &counter);
        assert!(outcome.suos.iter().any(|s| s.message_type == MessageType::RfidSnapshot));
        let snap = cache.telemetry_snapshot("dev-1", 1);
        assert_eq!(snap.rfid_snapshot.len(), 1);
    }

    #[test]
    fn rfid_event_json_family_emits_command_without_touching_cache() {
        let cache = StateCache::new();
        let mut sif = Sif::new("V6800", "dev-1", MessageType::RfidEvent);
        sif.data = vec![json!({"moduleIndex": 1, "data": [{"uIndex": 3, "action": "DETACHED"}]})];
        let counter = AtomicU64::new(1);
        let outcome = normalize(&sif, &cache, &counter);
        assert!(outcome.suos.is_empty());
        assert_eq!(outcome.commands.len(), 1);
        assert_eq!(outcome.commands[0].command_type, CommandType::QryRfidSnapshot);
        assert_eq!(outcome.commands[0].module_index, Some(1));
        let snap = cache.telemetry_snapshot("dev-1", 1);
        assert!(snap.rfid_snapshot.is_empty());
    }

    #[test]
    fn heartbeat_creates_telemetry_and_metadata_without_spurious_change_event() {
        let cache = StateCache::new();
        let mut sif = Sif::new("V5008", "dev-1", MessageType::Heartbeat);
        sif.data = vec![json!({"moduleIndex": 1, "moduleId": "7", "uTotal": 6})];
        let counter = AtomicU64::new(1);
        let outcome = normalize(&sif, &cache, &counter);
        // first contact always changes something (module added), so a DEVICE_METADATA SUO is expected
        assert!(outcome.suos.iter().any(|s| s.message_type == MessageType::DeviceMetadata));
        let telemetry = cache.telemetry_snapshot("dev-1", 1);
        assert!(telemetry.is_online);
    }

    #[test]
    fn heartbeat_without_metadata_changes_emits_only_heartbeat_suo() {
        let cache = StateCache::new();
        cache.with_metadata_mut("dev-1", "V5008", |meta| {
            meta.active_modules.push(ModuleInfo {
                module_index: 1,
                module_id: "7".to_string(),
                u_total: Some(6),
                fw_ver: None,
            });
        });
        let mut sif = Sif::new("V5008", "dev-1", MessageType::Heartbeat);
        sif.data = vec![json!({"moduleIndex": 1, "moduleId": "7", "uTotal": 6})];
        let counter = AtomicU64::new(1);
        let outcome = normalize(&sif, &cache, &counter);
        assert_eq!(outcome.suos.len(), 1);
        assert_eq!(outcome.suos[0].message_type, MessageType::Heartbeat);
    }

    #[test]
    fn heartbeat_reconnect_without_other_changes_emits_single_online_suo() {
        let cache = StateCache::new();
        cache.with_metadata_mut("dev-1", "V5008", |meta| {
            meta.active_modules.push(ModuleInfo {
                module_index: 1,
                module_id: "7".to_string(),
                u_total: Some(6),
                fw_ver: None,
            });
        });
        cache.with_telemetry_mut("dev-1", 1, |entry| {
            entry.is_online = false;
            entry.last_seen_hb = Some(Utc::now() - chrono::Duration::seconds(120));
        });
        let mut sif = Sif::new("V5008", "dev-1", MessageType::Heartbeat);
        sif.data = vec![json!({"moduleIndex": 1, "moduleId": "7", "uTotal": 6})];
        let counter = AtomicU64::new(1);
        let outcome = normalize(&sif, &cache, &counter);
        assert_eq!(outcome.suos.len(), 2);
        assert_eq!(outcome.suos[0].message_type, MessageType::Heartbeat);
        assert_eq!(outcome.suos[1].message_type, MessageType::DeviceMetadata);
        assert_eq!(outcome.suos[1].payload[0]["isOnline"], Value::from(true));
        assert!(cache.telemetry_snapshot("dev-1", 1).is_online);
    }

    #[test]
    fn heartbeat_reconnect_with_metadata_change_still_sets_is_online() {
        let cache = StateCache::new();
        cache.with_metadata_mut("dev-1", "V5008", |meta| {
            meta.ip = Some("192.168.0.10".to_string());
            meta.active_modules.push(ModuleInfo {
                module_index: 1,
                module_id: "7".to_string(),
                u_total: Some(6),
                fw_ver: None,
            });
        });
        cache.with_telemetry_mut("dev-1", 1, |entry| {
            entry.is_online = false;
            entry.last_seen_hb = Some(Utc::now() - chrono::Duration::seconds(120));
        });
        let mut sif = Sif::new("V5008", "dev-1", MessageType::Heartbeat);
        sif.data = vec![json!({"moduleIndex": 1, "moduleId": "7", "uTotal": 6})];
        sif.extra.insert("ip".to_string(), Value::from("192.168.0.11"));
        let counter = AtomicU64::new(1);
        let outcome = normalize(&sif, &cache, &counter);
        let meta_suo = outcome
            .suos
            .iter()
            .find(|s| s.message_type == MessageType::DeviceMetadata)
            .expect("expected a DEVICE_METADATA SUO");
        assert_eq!(meta_suo.payload[0]["isOnline"], Value::from(true));
    }

    #[test]
    fn metadata_change_detection_reports_ip_change() {
        let cache = StateCache::new();
        cache.with_metadata_mut("dev-1", "V6800", |meta| {
            meta.ip = Some("192.168.0.10".to_string());
        });
        let mut sif = Sif::new("V6800", "dev-1", MessageType::Heartbeat);
        sif.extra.insert("ip".to_string(), Value::from("192.168.0.11"));
        let counter = AtomicU64::new(1);
        let outcome = normalize(&sif, &cache, &counter);
        let change_suo = outcome
            .suos
            .iter()
            .find(|s| s.message_type == MessageType::MetaChangedEvent)
            .expect("expected a META_CHANGED_EVENT SUO");
        assert_eq!(
            change_suo.payload[0],
            Value::from("ip changed: 192.168.0.10 → 192.168.0.11")
        );
    }

    #[test]
    fn incremental_metadata_update_does_not_remove_missing_modules() {
        let mut meta = DeviceMetadata {
            active_modules: vec![
                ModuleInfo { module_index: 1, module_id: "A".to_string(), u_total: Some(6), fw_ver: None },
                ModuleInfo { module_index: 2, module_id: "B".to_string(), u_total: Some(6), fw_ver: None },
            ],
            ..Default::default()
        };
        let incoming = vec![ModuleInfo { module_index: 1, module_id: "A".to_string(), u_total: Some(6), fw_ver: None }];
        let changes = merge_modules(&mut meta, &incoming, false);
        assert!(changes.is_empty());
        assert_eq!(meta.active_modules.len(), 2);
    }

    #[test]
    fn full_snapshot_metadata_update_removes_missing_modules() {
        let mut meta = DeviceMetadata {
            active_modules: vec![
                ModuleInfo { module_index: 1, module_id: "A".to_string(), u_total: Some(6), fw_ver: None },
                ModuleInfo { module_index: 2, module_id: "B".to_string(), u_total: Some(6), fw_ver: None },
            ],
            ..Default::default()
        };
        let incoming = vec![ModuleInfo { module_index: 1, module_id: "A".to_string(), u_total: Some(6), fw_ver: None }];
        let changes = merge_modules(&mut meta, &incoming, true);
        assert_eq!(changes, vec!["module 2 removed".to_string()]);
        assert_eq!(meta.active_modules.len(), 1);
    }

    #[test]
    fn partition_for_is_stable_for_same_device_id() {
        assert_eq!(partition_for("dev-1", 8), partition_for("dev-1", 8));
    }
}
