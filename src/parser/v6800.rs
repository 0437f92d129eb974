//! V6800 JSON payload decoder
//!
//! Unlike the binary family, every V6800 payload is one JSON object whose
//! `msg_type` selects both the SIF `messageType` and which of the device's
//! quirky field names apply (`module_index` vs `host_gateway_port_index`,
//! `module_sn` vs `extend_module_sn`, ...). The mapping table is applied
//! uniformly by running every incoming object through the same
//! [`map_common_fields`] step before dispatching on type.

use serde_json::Value;
use tracing::warn;

use super::Parser;
use crate::model::{MessageType, RawPayload, Sif};

pub struct V6800Parser;

impl Parser for V6800Parser {
    fn parse(&self, _topic: &str, payload: &RawPayload) -> Option<Sif> {
        let text = match payload {
            RawPayload::Text(t) => t,
            RawPayload::Binary(_) => {
                warn!("V6800 parser received binary payload");
                return None;
            }
        };
        let root: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "invalid V6800 JSON payload");
                return None;
            }
        };
        decode(&root)
    }
}

fn msg_type_to_message_type(msg_type: &str) -> MessageType {
    match msg_type {
        "heart_beat_req" => MessageType::Heartbeat,
        "u_state_resp" => MessageType::RfidSnapshot,
        "u_state_changed_notify_req" => MessageType::RfidEvent,
        "temper_humidity_exception_nofity_req" => MessageType::TempHum,
        "temper_humidity_resp" => MessageType::QryTempHumResp,
        "door_state_changed_notify_req" => MessageType::DoorState,
        "door_state_resp" => MessageType::QryDoorStateResp,
        "devies_init_req" => MessageType::DevModInfo,
        "devices_changed_req" => MessageType::UtotalChanged,
        "u_color" => MessageType::QryClrResp,
        "set_module_property_result_req" => MessageType::SetClrResp,
        "clear_u_warning" => MessageType::ClnAlmResp,
        _ => MessageType::Unknown,
    }
}

fn str_field<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn num_field(obj: &Value, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_i64)
}

fn device_id_of(root: &Value, msg_type: &str) -> Option<String> {
    if msg_type == "heart_beat_req" && str_field(root, "module_type") == Some("mt_gw") {
        if let Some(sn) = str_field(root, "module_sn") {
            return Some(sn.to_string());
        }
    }
    str_field(root, "gateway_sn").map(str::to_string)
}

fn module_index_of(obj: &Value) -> Option<u32> {
    num_field(obj, "module_index")
        .or_else(|| num_field(obj, "host_gateway_port_index"))
        .map(|n| n as u32)
}

fn module_id_of(obj: &Value) -> Option<String> {
    str_field(obj, "module_sn")
        .or_else(|| str_field(obj, "extend_module_sn"))
        .map(str::to_string)
}

/// Maps one module/sensor entry (from a nested `data` array) into the
/// uniform camelCase shape SIF consumers expect.
fn map_entry(entry: &Value) -> Value {
    let mut out = serde_json::Map::new();
    if let Some(idx) = module_index_of(entry) {
        out.insert("moduleIndex".to_string(), Value::from(idx));
    }
    if let Some(id) = module_id_of(entry) {
        out.insert("moduleId".to_string(), Value::from(id));
    }
    if let Some(u_total) = num_field(entry, "module_u_num") {
        out.insert("uTotal".to_string(), Value::from(u_total));
    }
    if let Some(fw) = str_field(entry, "module_sw_version") {
        out.insert("fwVer".to_string(), Value::from(fw));
    }
    if let Some(u_index) = num_field(entry, "u_index") {
        out.insert("uIndex".to_string(), Value::from(u_index));
    }
    if entry.get("tag_code").is_some() {
        let tag_id = str_field(entry, "tag_code").filter(|s| !s.is_empty());
        out.insert("tagId".to_string(), tag_id.map(Value::from).unwrap_or(Value::Null));
    }
    if let Some(warning) = num_field(entry, "warning") {
        out.insert("isAlarm".to_string(), Value::from(warning != 0));
    }
    if let (Some(new_state), Some(old_state)) = (num_field(entry, "new_state"), num_field(entry, "old_state")) {
        let action = match (old_state, new_state) {
            (1, 0) => "ATTACHED",
            (0, 1) => "DETACHED",
            _ => "UNKNOWN",
        };
        out.insert("action".to_string(), Value::from(action));
    }
    if let Some(pos) = num_field(entry, "temper_position") {
        out.insert("thIndex".to_string(), Value::from(pos));
    }
    if let Some(temp) = entry.get("temper_swot").and_then(Value::as_f64) {
        out.insert("temp".to_string(), Value::from(temp));
    }
    if let Some(hum) = entry.get("hygrometer_swot").and_then(Value::as_f64) {
        out.insert("hum".to_string(), Value::from(hum));
    }
    if let Some(color) = str_field(entry, "color") {
        out.insert("colorName".to_string(), Value::from(color));
    }
    if let Some(code) = entry.get("code") {
        out.insert("colorCode".to_string(), code.clone());
    }
    // Recurse into a nested per-sensor `data` array (the two-level shape
    // used by RFID and temperature/humidity module-scoped notifications).
    if let Some(nested) = entry.get("data").and_then(Value::as_array) {
        out.insert(
            "data".to_string(),
            Value::Array(nested.iter().map(map_entry).collect()),
        );
    }
    Value::Object(out)
}

fn decode(root: &Value) -> Option<Sif> {
    let msg_type = match str_field(root, "msg_type") {
        Some(s) => s,
        None => {
            warn!("V6800 payload missing msg_type");
            return None;
        }
    };
    let message_type = msg_type_to_message_type(msg_type);
    let device_id = match device_id_of(root, msg_type) {
        Some(id) => id,
        None => {
            warn!(msg_type, "V6800 payload missing gateway_sn");
            return None;
        }
    };

    let mut sif = Sif::new("V6800", device_id, message_type);
    sif.message_id = root.get("uuid_number").map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    if let Some(ip) = str_field(root, "gateway_ip") {
        sif.extra.insert("ip".to_string(), Value::from(ip));
    }
    if let Some(mac) = str_field(root, "gateway_mac") {
        sif.extra.insert("mac".to_string(), Value::from(mac));
    }

    match message_type {
        MessageType::DoorState | MessageType::QryDoorStateResp => {
            if root.get("new_state1").is_some() || root.get("new_state2").is_some() {
                if let Some(s1) = num_field(root, "new_state1") {
                    sif.extra.insert("door1State".to_string(), Value::from(s1));
                }
                if let Some(s2) = num_field(root, "new_state2") {
                    sif.extra.insert("door2State".to_string(), Value::from(s2));
                }
            } else if let Some(state) = num_field(root, "new_state") {
                sif.extra.insert("doorState".to_string(), Value::from(state));
            }
            if let Some(idx) = module_index_of(root) {
                sif.module_index = Some(idx);
            }
        }
        MessageType::QryClrResp | MessageType::SetClrResp | MessageType::ClnAlmResp => {
            if let Some(color) = str_field(root, "color") {
                sif.extra.insert("colorName".to_string(), Value::from(color));
            }
            if let Some(code) = root.get("code") {
                sif.extra.insert("colorCode".to_string(), code.clone());
            }
            if let Some(result) = root.get("result") {
                sif.extra.insert("result".to_string(), result.clone());
            }
        }
        _ => {}
    }

    if let Some(entries) = root.get("data").and_then(Value::as_array) {
        sif.data = entries.iter().map(map_entry).collect();
    } else if message_type == MessageType::Unknown {
        // Preserve the raw payload for an unrecognized type rather than
        // dropping it, per the dispatch table's "anything else" rule.
        sif.extra.insert("rawPayload".to_string(), root.clone());
    }

    Some(sif)
}
