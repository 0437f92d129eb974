//! V5008 binary frame decoder
//!
//! Frames are little-endian, little else is fixed-width: module, sensor and
//! tag lists are prefixed with a one-byte count, and the command-response
//! frame's trailing color map is sized by what's left in the buffer. This
//! decoder never panics on malformed input — every read is checked and a
//! short or inconsistent buffer yields `None`, matching the "ParseError:
//! logged, SIF null, no downstream effect" rule.

use bytes::Buf;
use serde_json::{json, Value};
use tracing::warn;

use super::Parser;
use crate::model::{MessageType, RawPayload, Sif};

/// V5008 frame layout constants.
mod constants {
    pub const DEVICE_ID_LEN: usize = 6;

    pub const HEADER_HEARTBEAT_A: u8 = 0xCC;
    pub const HEADER_HEARTBEAT_B: u8 = 0xCB;
    pub const HEADER_RFID_SNAPSHOT: u8 = 0xBB;
    pub const HEADER_DOOR_STATE: u8 = 0xBA;
    pub const HEADER_EXT: u8 = 0xEF;
    pub const HEADER_EXT_DEVICE_INFO: u8 = 0x01;
    pub const HEADER_EXT_MODULE_INFO: u8 = 0x02;
    pub const HEADER_CMD_RESP: u8 = 0xAA;

    pub const CMD_QRY_CLR_RESP: u8 = 0xE4;
    pub const CMD_SET_CLR_RESP: u8 = 0xE1;
    pub const CMD_CLN_ALM_RESP: u8 = 0xE2;

    /// opcode(1) + deviceId(6) + cmd(1) + reqLen field(2)
    pub const CMD_RESP_FIXED_OVERHEAD: usize = 10;
    pub const CMD_QRY_CLR_REQ_LEN: usize = 2;

    pub const MAX_MODULE_ADDR: u8 = 5;

    pub const MODEL_FIELD_LEN: usize = 8;
    pub const FW_VER_FIELD_LEN: usize = 8;
    pub const IP_FIELD_LEN: usize = 4;
    pub const MASK_FIELD_LEN: usize = 4;
    pub const MAC_FIELD_LEN: usize = 6;
}

use constants::*;

pub struct V5008Parser;

impl Parser for V5008Parser {
    fn parse(&self, topic: &str, payload: &RawPayload) -> Option<Sif> {
        let bytes = match payload {
            RawPayload::Binary(b) => b.as_slice(),
            RawPayload::Text(_) => {
                warn!(topic, "V5008 parser received text payload");
                return None;
            }
        };
        decode(topic, bytes)
    }
}

fn decode(topic: &str, bytes: &[u8]) -> Option<Sif> {
    if topic.ends_with("/TemHum") {
        return decode_temp_hum(bytes);
    }
    if topic.ends_with("/Noise") {
        return decode_noise(bytes);
    }

    let mut buf = bytes;
    if buf.remaining() < 1 {
        warn!("V5008 frame shorter than one header byte");
        return None;
    }
    let header = buf.get_u8();
    match header {
        HEADER_HEARTBEAT_A | HEADER_HEARTBEAT_B => decode_heartbeat(buf),
        HEADER_RFID_SNAPSHOT => decode_rfid_snapshot(buf),
        HEADER_DOOR_STATE => decode_door_state(buf),
        HEADER_EXT => decode_ext(buf),
        HEADER_CMD_RESP => decode_command_response(buf),
        other => {
            warn!(header = format!("{other:#04x}"), "unknown V5008 frame header");
            None
        }
    }
}

fn read_device_id(buf: &mut &[u8]) -> Option<String> {
    if buf.remaining() < DEVICE_ID_LEN {
        return None;
    }
    let mut raw = [0u8; DEVICE_ID_LEN];
    buf.copy_to_slice(&mut raw);
    Some(
        String::from_utf8_lossy(&raw)
            .trim_end_matches(['\0', ' '])
            .to_string(),
    )
}

/// Two's-complement-ish signed decimal: top bit of the integer byte marks
/// negative, the remaining 7 bits are the magnitude's integer part, the
/// fractional byte is always a positive hundredths part.
fn decode_signed_decimal(int_byte: u8, frac_byte: u8) -> f64 {
    let frac = frac_byte as f64 / 100.0;
    if int_byte & 0x80 != 0 {
        -(((int_byte & 0x7F) as f64) + frac)
    } else {
        int_byte as f64 + frac
    }
}

fn decode_heartbeat(mut buf: &[u8]) -> Option<Sif> {
    let device_id = read_device_id(&mut buf)?;
    if buf.remaining() < 1 {
        return None;
    }
    let slot_count = buf.get_u8();
    let mut modules = Vec::new();
    for _ in 0..slot_count {
        if buf.remaining() < 3 {
            warn!(device_id, "truncated heartbeat module slot");
            return None;
        }
        let module_addr = buf.get_u8();
        let module_id = buf.get_u8();
        let u_total = buf.get_u8();
        if module_id == 0 || module_addr > MAX_MODULE_ADDR {
            continue;
        }
        modules.push(json!({
            "moduleIndex": module_addr,
            "moduleId": module_id.to_string(),
            "uTotal": u_total,
        }));
    }
    let mut sif = Sif::new("V5008", device_id, MessageType::Heartbeat);
    sif.data = modules;
    Some(sif)
}

fn decode_rfid_snapshot(mut buf: &[u8]) -> Option<Sif> {
    let device_id = read_device_id(&mut buf)?;
    if buf.remaining() < 1 {
        return None;
    }
    let slot_count = buf.get_u8();
    let mut tags = Vec::new();
    for _ in 0..slot_count {
        if buf.remaining() < 2 {
            warn!(device_id, "truncated RFID slot header");
            return None;
        }
        let u_index = buf.get_u8();
        let tag_len = buf.get_u8() as usize;
        if buf.remaining() < tag_len + 1 {
            warn!(device_id, "truncated RFID tag payload");
            return None;
        }
        let mut tag_bytes = vec![0u8; tag_len];
        buf.copy_to_slice(&mut tag_bytes);
        let is_alarm = buf.get_u8() != 0;
        let tag_id = if tag_len == 0 {
            None
        } else {
            Some(String::from_utf8_lossy(&tag_bytes).to_string())
        };
        tags.push(json!({ "uIndex": u_index, "tagId": tag_id, "isAlarm": is_alarm }));
    }
    let mut sif = Sif::new("V5008", device_id, MessageType::RfidSnapshot);
    sif.data = tags;
    Some(sif)
}

fn decode_temp_hum(mut buf: &[u8]) -> Option<Sif> {
    let device_id = read_device_id(&mut buf)?;
    if buf.remaining() < 1 {
        return None;
    }
    let slot_count = buf.get_u8();
    let mut readings = Vec::new();
    for _ in 0..slot_count {
        if buf.remaining() < 5 {
            warn!(device_id, "truncated temp/hum slot");
            return None;
        }
        let addr = buf.get_u8();
        let temp_int = buf.get_u8();
        let temp_frac = buf.get_u8();
        let hum_int = buf.get_u8();
        let hum_frac = buf.get_u8();
        if addr == 0 {
            continue;
        }
        readings.push(json!({
            "thIndex": addr,
            "temp": decode_signed_decimal(temp_int, temp_frac),
            "hum": decode_signed_decimal(hum_int, hum_frac),
        }));
    }
    let mut sif = Sif::new("V5008", device_id, MessageType::TempHum);
    sif.data = readings;
    Some(sif)
}

fn decode_noise(mut buf: &[u8]) -> Option<Sif> {
    let device_id = read_device_id(&mut buf)?;
    if buf.remaining() < 1 {
        return None;
    }
    let slot_count = buf.get_u8();
    let mut readings = Vec::new();
    for _ in 0..slot_count {
        if buf.remaining() < 3 {
            warn!(device_id, "truncated noise slot");
            return None;
        }
        let addr = buf.get_u8();
        let noise_int = buf.get_u8();
        let noise_frac = buf.get_u8();
        if addr == 0 {
            continue;
        }
        readings.push(json!({
            "nsIndex": addr,
            "noise": decode_signed_decimal(noise_int, noise_frac),
        }));
    }
    let mut sif = Sif::new("V5008", device_id, MessageType::NoiseLevel);
    sif.data = readings;
    Some(sif)
}

fn decode_door_state(mut buf: &[u8]) -> Option<Sif> {
    let device_id = read_device_id(&mut buf)?;
    if buf.remaining() < 1 {
        return None;
    }
    let door_state = buf.get_u8();
    let mut sif = Sif::new("V5008", device_id, MessageType::DoorState);
    sif.extra.insert("doorState".to_string(), Value::from(door_state));
    Some(sif)
}

fn decode_ext(mut buf: &[u8]) -> Option<Sif> {
    if buf.remaining() < 1 {
        return None;
    }
    match buf.get_u8() {
        HEADER_EXT_DEVICE_INFO => decode_device_info(buf),
        HEADER_EXT_MODULE_INFO => decode_module_info(buf),
        other => {
            warn!(sub = format!("{other:#04x}"), "unknown V5008 extended header");
            None
        }
    }
}

fn read_fixed_ascii(buf: &mut &[u8], len: usize) -> Option<String> {
    if buf.remaining() < len {
        return None;
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Some(String::from_utf8_lossy(&raw).trim_end_matches(['\0', ' ']).to_string())
}

fn decode_device_info(mut buf: &[u8]) -> Option<Sif> {
    let device_id = read_device_id(&mut buf)?;
    let model = read_fixed_ascii(&mut buf, MODEL_FIELD_LEN)?;
    let fw_ver = read_fixed_ascii(&mut buf, FW_VER_FIELD_LEN)?;
    if buf.remaining() < IP_FIELD_LEN + MASK_FIELD_LEN + IP_FIELD_LEN + MAC_FIELD_LEN {
        return None;
    }
    let ip = read_ipv4(&mut buf);
    let mask = read_ipv4(&mut buf);
    let gw_ip = read_ipv4(&mut buf);
    let mac = read_mac(&mut buf);

    let mut sif = Sif::new("V5008", device_id.clone(), MessageType::DeviceInfo);
    sif.extra.insert("deviceId".to_string(), Value::from(device_id));
    sif.extra.insert("model".to_string(), Value::from(model));
    sif.extra.insert("fwVer".to_string(), Value::from(fw_ver));
    sif.extra.insert("ip".to_string(), Value::from(ip));
    sif.extra.insert("mask".to_string(), Value::from(mask));
    sif.extra.insert("gwIp".to_string(), Value::from(gw_ip));
    sif.extra.insert("mac".to_string(), Value::from(mac));
    Some(sif)
}

fn read_ipv4(buf: &mut &[u8]) -> String {
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    octets.iter().map(u8::to_string).collect::<Vec<_>>().join(".")
}

fn read_mac(buf: &mut &[u8]) -> String {
    let mut octets = [0u8; 6];
    buf.copy_to_slice(&mut octets);
    octets.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

fn decode_module_info(mut buf: &[u8]) -> Option<Sif> {
    let device_id = read_device_id(&mut buf)?;
    if buf.remaining() < 1 {
        return None;
    }
    let slot_count = buf.get_u8();
    let mut modules = Vec::new();
    for _ in 0..slot_count {
        if buf.remaining() < 1 + FW_VER_FIELD_LEN {
            warn!(device_id, "truncated module-info slot");
            return None;
        }
        let module_index = buf.get_u8();
        let fw_ver = read_fixed_ascii(&mut buf, FW_VER_FIELD_LEN)?;
        modules.push(json!({ "moduleIndex": module_index, "fwVer": fw_ver }));
    }
    let mut sif = Sif::new("V5008", device_id, MessageType::ModuleInfo);
    sif.data = modules;
    Some(sif)
}

fn decode_command_response(mut buf: &[u8]) -> Option<Sif> {
    let device_id = read_device_id(&mut buf)?;
    if buf.remaining() < 3 {
        return None;
    }
    let cmd = buf.get_u8();
    let req_len_field = buf.get_u16_le() as usize;

    let message_type = match cmd {
        CMD_QRY_CLR_RESP => MessageType::QryClrResp,
        CMD_SET_CLR_RESP => MessageType::SetClrResp,
        CMD_CLN_ALM_RESP => MessageType::ClnAlmResp,
        other => {
            warn!(device_id, cmd = format!("{other:#04x}"), "unknown command-response code");
            return None;
        }
    };

    let req_len = if cmd == CMD_QRY_CLR_RESP {
        CMD_QRY_CLR_REQ_LEN
    } else {
        req_len_field.saturating_sub(CMD_RESP_FIXED_OVERHEAD)
    };

    if buf.remaining() < req_len {
        warn!(device_id, req_len, "command response shorter than declared originalReq");
        return None;
    }
    let mut original_req = vec![0u8; req_len];
    buf.copy_to_slice(&mut original_req);

    let color_map: Vec<u8> = buf.chunk().to_vec();

    let mut sif = Sif::new("V5008", device_id, message_type);
    sif.extra.insert(
        "originalReq".to_string(),
        Value::from(original_req.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>()),
    );
    if !color_map.is_empty() {
        sif.extra.insert("colorMap".to_string(), Value::from(color_map));
    }
    Some(sif)
}
