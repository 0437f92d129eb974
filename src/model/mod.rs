//! Shared wire types: SIF (parser output) and SUO (normalizer output)
//!
//! Every component downstream of ingress speaks these two shapes. A SIF
//! carries one device's raw reading translated out of its wire format but
//! not yet reconciled against history; a SUO is the canonical, diffed event
//! the rest of the system (storage, feed) consumes. Type-specific fields
//! that don't apply to every message (ip/mac on metadata, doorState on a
//! door event, the RFID tag array) live in `extra`/`payload` rather than as
//! named struct fields, since the set of fields is a function of
//! `message_type` and a fixed struct would be mostly `None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which product line a device belongs to. Parsing, topic layout and wire
/// format all key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProtocolFamily {
    V5008,
    V6800,
}

impl ProtocolFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolFamily::V5008 => "V5008",
            ProtocolFamily::V6800 => "V6800",
        }
    }
}

impl std::fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every message type the pipeline knows how to produce or consume, shared
/// between SIF (parser output) and SUO (normalizer output). `Unknown` is a
/// deliberate catch-all: a parser that can't classify a payload still
/// produces a SIF rather than an error, so the rest of the system always has
/// something to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Heartbeat,
    RfidSnapshot,
    RfidEvent,
    TempHum,
    QryTempHumResp,
    NoiseLevel,
    DoorState,
    QryDoorStateResp,
    DeviceInfo,
    ModuleInfo,
    DevModInfo,
    UtotalChanged,
    QryClrResp,
    SetClrResp,
    ClnAlmResp,
    /// Synthetic: the device metadata snapshot currently held in the cache,
    /// emitted by the normalizer itself rather than derived from one SIF.
    DeviceMetadata,
    /// Synthetic: a human-readable description of what changed about a
    /// device's metadata since the last snapshot.
    MetaChangedEvent,
    Unknown,
}

/// Commands the command service can send downstream to a device. Distinct
/// from `MessageType` because commands flow the opposite direction (toward
/// the device) and are requested by the normalizer, not parsed from a
/// device payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    QryRfidSnapshot,
    ClrAlarm,
    SetColor,
    Reboot,
}

/// The raw bytes or text an ingress subscription delivered, tagged with
/// enough routing metadata for a parser to be picked without inspecting the
/// payload itself.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub protocol_family: ProtocolFamily,
    pub device_id: String,
    /// The device-reported message kind as it appears on the wire (a
    /// numeric opcode for V5008, a `msgType` string for V6800) before any
    /// normalization into [`MessageType`].
    pub raw_message_type: String,
    pub topic: String,
    pub payload: RawPayload,
    pub received_at: DateTime<Utc>,
}

/// V5008 frames are binary; V6800 payloads are JSON text. Parsers dispatch
/// on this rather than assuming an encoding from the protocol family alone,
/// since malformed input can arrive as either.
#[derive(Debug, Clone)]
pub enum RawPayload {
    Binary(Vec<u8>),
    Text(String),
}

/// Standard Intermediate Format: one device's reading, translated out of its
/// wire representation, not yet reconciled against cached history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sif {
    pub device_type: String,
    pub device_id: String,
    pub message_type: MessageType,
    pub message_id: Option<String>,
    pub meta: SifMeta,
    pub module_index: Option<u32>,
    pub module_id: Option<String>,
    /// Type-specific scalar fields (ip, mac, doorState, cmd, result, ...),
    /// flattened to the JSON root on the wire.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Variable-length sensor/tag arrays (temp/hum readings, RFID tags).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<Value>,
}

impl Sif {
    pub fn new(device_type: impl Into<String>, device_id: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            device_type: device_type.into(),
            device_id: device_id.into(),
            message_type,
            message_id: None,
            meta: SifMeta::default(),
            module_index: None,
            module_id: None,
            extra: Map::new(),
            data: Vec::new(),
        }
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn extra_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(Value::as_u64)
    }
}

/// Provenance fields carried through from ingress: useful for diagnostics
/// and for the storage writer's audit columns, never interpreted by the
/// normalizer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SifMeta {
    pub topic: String,
    pub raw_message_type: String,
    pub received_at: Option<DateTime<Utc>>,
}

/// Standard Unified Object: the canonical, diffed event that storage and the
/// feed emitter consume. Unlike a SIF, a SUO always represents something
/// that changed (or a deliberate periodic snapshot) — the normalizer is
/// responsible for not emitting SUOs for unchanged state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suo {
    pub message_type: MessageType,
    pub message_id: String,
    pub device_id: String,
    pub device_type: String,
    pub module_index: Option<u32>,
    pub module_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<Value>,
}

impl Suo {
    pub fn new(
        message_type: MessageType,
        message_id: impl Into<String>,
        device_id: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self {
            message_type,
            message_id: message_id.into(),
            device_id: device_id.into(),
            device_type: device_type.into(),
            module_index: None,
            module_id: None,
            occurred_at: Utc::now(),
            extra: Map::new(),
            payload: Vec::new(),
        }
    }
}

/// A command the normalizer wants sent back down to a device, handed to the
/// command service over the `command.request` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command_type: CommandType,
    pub protocol_family: ProtocolFamily,
    pub device_id: String,
    pub module_index: Option<u32>,
    #[serde(default)]
    pub params: Value,
}

/// An error surfaced by any component, republished on the `error` topic so
/// a single subscriber (today: tracing, potentially a future alerting sink)
/// can observe every failure in the system without each component needing
/// its own logging policy.
#[derive(Debug, Clone)]
pub struct PipelineErrorEvent {
    pub source: &'static str,
    pub message: String,
    pub context: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_family_display() {
        assert_eq!(ProtocolFamily::V5008.to_string(), "V5008");
        assert_eq!(ProtocolFamily::V6800.to_string(), "V6800");
    }

    #[test]
    fn message_type_serializes_screaming_snake_case() {
        let v = serde_json::to_value(MessageType::TempHum).unwrap();
        assert_eq!(v, Value::String("TEMP_HUM".to_string()));
        let v = serde_json::to_value(MessageType::RfidSnapshot).unwrap();
        assert_eq!(v, Value::String("RFID_SNAPSHOT".to_string()));
    }

    #[test]
    fn sif_extra_accessors() {
        let mut sif = Sif::new("V6800", "dev-1", MessageType::DoorState);
        sif.extra.insert("doorState".to_string(), Value::from(1));
        assert_eq!(sif.extra_u64("doorState"), Some(1));
        assert_eq!(sif.extra_str("missing"), None);
    }

    #[test]
    fn sif_round_trips_through_json() {
        let mut sif = Sif::new("V5008", "dev-2", MessageType::Heartbeat);
        sif.message_id = Some("mid-1".to_string());
        sif.data.push(Value::from(42));
        let json = serde_json::to_string(&sif).unwrap();
        let back: Sif = serde_json::from_str(&json).unwrap();
        assert_eq!(back.device_id, "dev-2");
        assert_eq!(back.data, vec![Value::from(42)]);
    }
}
