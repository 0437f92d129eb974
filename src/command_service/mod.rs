//! Command service: the one outbound path, symmetric with ingress
//!
//! Subscribes to `command.request`, resolves the target device's protocol
//! family from the metadata cache (set by whatever inbound message first
//! established the device), encodes the command for that family, and
//! publishes on the broker's `downloadTopicPrefix/<deviceId>` at QoS 1.
//! Acknowledgements are not awaited synchronously — a failed publish
//! becomes an `error` event rather than blocking the command queue on a
//! slow or disconnected broker.

use std::sync::Arc;

use rumqttc::{AsyncClient, QoS};
use serde_json::json;
use tracing::warn;

use crate::bus::EventBus;
use crate::cache::StateCache;
use crate::common::shutdown::ShutdownReceiver;
use crate::common::{AtomicCounters, MiddlewareResult};
use crate::model::{CommandRequest, CommandType, ProtocolFamily};

/// Binary opcodes for outbound commands, symmetric with the V5008 parser's
/// inbound header bytes.
mod v5008_opcodes {
    pub const QRY_RFID_SNAPSHOT: u8 = 0xBB;
    pub const CLR_ALARM: u8 = 0xE2;
    pub const SET_COLOR: u8 = 0xE1;
    pub const REBOOT: u8 = 0xE3;
}

fn json_msg_type(command_type: CommandType) -> &'static str {
    match command_type {
        CommandType::QryRfidSnapshot => "u_state_req",
        CommandType::ClrAlarm => "u_clr_alarm",
        CommandType::SetColor => "u_set_color",
        CommandType::Reboot => "u_reboot",
    }
}

fn encode_json_command(cmd: &CommandRequest) -> Vec<u8> {
    let mut obj = json!({
        "msg_type": json_msg_type(cmd.command_type),
        "gateway_sn": cmd.device_id,
    });
    if let Some(module_index) = cmd.module_index {
        obj["module_index"] = json!(module_index);
    }
    if !cmd.params.is_null() {
        obj["params"] = cmd.params.clone();
    }
    serde_json::to_vec(&obj).unwrap_or_default()
}

fn encode_binary_command(cmd: &CommandRequest) -> Vec<u8> {
    let opcode = match cmd.command_type {
        CommandType::QryRfidSnapshot => v5008_opcodes::QRY_RFID_SNAPSHOT,
        CommandType::ClrAlarm => v5008_opcodes::CLR_ALARM,
        CommandType::SetColor => v5008_opcodes::SET_COLOR,
        CommandType::Reboot => v5008_opcodes::REBOOT,
    };
    let mut buf = vec![opcode];
    let mut device_id_bytes = cmd.device_id.as_bytes().to_vec();
    device_id_bytes.resize(6, 0);
    buf.extend(device_id_bytes);
    buf.push(cmd.module_index.unwrap_or(0) as u8);
    buf
}

/// Command service task.
pub struct CommandService {
    cache: Arc<StateCache>,
    bus: Arc<EventBus>,
    mqtt_client: AsyncClient,
    download_topic_prefix: String,
    metrics: Arc<AtomicCounters>,
}

impl CommandService {
    pub fn new(cache: Arc<StateCache>, bus: Arc<EventBus>, mqtt_client: AsyncClient, download_topic_prefix: String) -> Arc<Self> {
        Arc::new(Self {
            cache,
            bus,
            mqtt_client,
            download_topic_prefix,
            metrics: Arc::new(AtomicCounters::new()),
        })
    }

    pub fn metrics(&self) -> &Arc<AtomicCounters> {
        &self.metrics
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: ShutdownReceiver) -> MiddlewareResult<()> {
        let mut rx = self.bus.subscribe_command_request();
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Ok(cmd) => self.dispatch(&cmd).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "command service lagged behind command.request");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        Ok(())
    }

    /// Resolve, encode and publish one command. Never returns an error to
    /// the caller — failures go through the `error` topic so one bad
    /// command never stalls the queue.
    async fn dispatch(&self, cmd: &CommandRequest) {
        self.metrics.inc_received();
        let protocol_family = match self.cache.metadata_snapshot(&cmd.device_id) {
            Some(meta) if meta.device_type == ProtocolFamily::V5008.as_str() => ProtocolFamily::V5008,
            Some(meta) if meta.device_type == ProtocolFamily::V6800.as_str() => ProtocolFamily::V6800,
            _ => {
                self.metrics.inc_dropped();
                self.bus.publish_error(
                    "command_service",
                    format!("unknown protocol family for device {}", cmd.device_id),
                    None,
                );
                return;
            }
        };

        let topic = format!("{}/{}", self.download_topic_prefix, cmd.device_id);
        let payload = match protocol_family {
            ProtocolFamily::V6800 => encode_json_command(cmd),
            ProtocolFamily::V5008 => encode_binary_command(cmd),
        };

        if let Err(err) = self
            .mqtt_client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            self.metrics.inc_dropped();
            self.bus.publish_error(
                "command_service",
                format!("publish failed for device {}: {err}", cmd.device_id),
                None,
            );
        } else {
            self.metrics.inc_processed();
        }
    }
}
