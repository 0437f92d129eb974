//! Ingress: the broker-facing edge of the pipeline
//!
//! Owns the inbound MQTT connection, classifies every message's topic into
//! `(protocolFamily, deviceId, rawMessageType)` without inspecting the
//! payload, and publishes a [`RawMessage`] onto `mqtt.message` for the
//! parser stage to pick up. This is the only component upstream of the bus
//! that talks to the outside world on the inbound side — the Command
//! Service is the symmetric outbound one, and the two keep distinct client
//! ids.
//!
//! Reconnection is exponential backoff starting at 2s, doubling to a 60s
//! cap, reset to the initial value on a successful (re)subscribe. A broker
//! outage never stops the loop; it just slows how fast ingress retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::common::shutdown::ShutdownReceiver;
use crate::common::{AtomicCounters, MiddlewareResult};
use crate::config::MqttConfig;
use crate::model::{ProtocolFamily, RawMessage, RawPayload};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Splits a broker `url` of the form `mqtt://host:port` (or bare
/// `host:port`) into its parts. Defaults to port 1883 when absent.
pub fn parse_broker_url(url: &str) -> (String, u16) {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);
    match stripped.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(1883)),
        None => (stripped.to_string(), 1883),
    }
}

/// Classify a subscribe-side topic into `(family, deviceId, rawMessageType)`:
/// family is read off the topic prefix, never the payload.
fn classify_topic(topic: &str) -> Option<(ProtocolFamily, String, String)> {
    let mut parts = topic.splitn(3, '/');
    let family_segment = parts.next()?;
    let device_id = parts.next()?.to_string();
    let raw_message_type = parts.next().unwrap_or_default().to_string();
    let family = if family_segment.starts_with("V5008") {
        ProtocolFamily::V5008
    } else if family_segment.starts_with("V6800") {
        ProtocolFamily::V6800
    } else {
        return None;
    };
    Some((family, device_id, raw_message_type))
}

/// Ingress task. Owns its own MQTT client/event loop; `bus` is the
/// process-wide collaborator shared with every other component.
pub struct Ingress {
    bus: Arc<EventBus>,
    config: MqttConfig,
    metrics: Arc<AtomicCounters>,
}

enum DrainOutcome {
    Shutdown,
    Disconnected { connected: bool },
}

impl Ingress {
    pub fn new(bus: Arc<EventBus>, config: MqttConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            metrics: Arc::new(AtomicCounters::new()),
        })
    }

    pub fn metrics(&self) -> &Arc<AtomicCounters> {
        &self.metrics
    }

    fn mqtt_options(&self) -> MqttOptions {
        let (host, port) = parse_broker_url(&self.config.broker_url);
        let mut opts = MqttOptions::new(self.config.options.client_id.clone(), host, port);
        opts.set_keep_alive(Duration::from_secs(self.config.options.keepalive_secs));
        opts.set_connection_timeout(self.config.options.connect_timeout_ms / 1000 + 1);
        opts
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: ShutdownReceiver) -> MiddlewareResult<()> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let (client, eventloop) = AsyncClient::new(self.mqtt_options(), 4096);
            if let Err(err) = client.subscribe(&self.config.topics.v5008, QoS::AtLeastOnce).await {
                warn!(error = %err, "failed to subscribe to V5008 topic");
            }
            if let Err(err) = client.subscribe(&self.config.topics.v6800, QoS::AtLeastOnce).await {
                warn!(error = %err, "failed to subscribe to V6800 topic");
            }

            match self.drain(eventloop, &mut shutdown_rx).await {
                DrainOutcome::Shutdown => {
                    let _ = client.disconnect().await;
                    break;
                }
                DrainOutcome::Disconnected { connected } => {
                    if connected {
                        backoff = INITIAL_BACKOFF;
                    }
                    warn!(backoff_secs = backoff.as_secs(), "ingress broker connection lost, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            }
        }
        Ok(())
    }

    async fn drain(&self, mut eventloop: EventLoop, shutdown_rx: &mut ShutdownReceiver) -> DrainOutcome {
        let mut backoff_reset_pending = true;
        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            if backoff_reset_pending {
                                info!("ingress connected to broker");
                                backoff_reset_pending = false;
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.handle_publish(&publish.topic, &publish.payload);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "ingress event loop error");
                            return DrainOutcome::Disconnected { connected: !backoff_reset_pending };
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("ingress shutting down");
                    return DrainOutcome::Shutdown;
                }
            }
        }
    }

    fn handle_publish(&self, topic: &str, payload: &[u8]) {
        self.metrics.inc_received();
        let Some((protocol_family, device_id, raw_message_type)) = classify_topic(topic) else {
            self.metrics.inc_dropped();
            self.bus.publish_error("ingress", format!("unrecognized topic prefix: {topic}"), None);
            return;
        };

        let raw_payload = match protocol_family {
            ProtocolFamily::V5008 => RawPayload::Binary(payload.to_vec()),
            ProtocolFamily::V6800 => RawPayload::Text(String::from_utf8_lossy(payload).into_owned()),
        };

        let message = RawMessage {
            protocol_family,
            device_id,
            raw_message_type,
            topic: topic.to_string(),
            payload: raw_payload,
            received_at: Utc::now(),
        };
        self.bus.publish_mqtt_message(message);
        self.metrics.inc_processed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_topic_splits_family_device_and_message_type() {
        let (family, device_id, raw_type) = classify_topic("V5008Upload/DEV001/Heartbeat").unwrap();
        assert_eq!(family, ProtocolFamily::V5008);
        assert_eq!(device_id, "DEV001");
        assert_eq!(raw_type, "Heartbeat");
    }

    #[test]
    fn classify_topic_handles_v6800_prefix() {
        let (family, device_id, _) = classify_topic("V6800Upload/DEV002/u_state_resp").unwrap();
        assert_eq!(family, ProtocolFamily::V6800);
        assert_eq!(device_id, "DEV002");
    }

    #[test]
    fn classify_topic_rejects_unknown_prefix() {
        assert!(classify_topic("Other/DEV001/x").is_none());
    }

    #[test]
    fn classify_topic_rejects_short_topic() {
        assert!(classify_topic("V5008Upload").is_none());
    }

    #[test]
    fn parse_broker_url_extracts_host_and_port() {
        assert_eq!(parse_broker_url("mqtt://broker.local:1883"), ("broker.local".to_string(), 1883));
        assert_eq!(parse_broker_url("broker.local:1884"), ("broker.local".to_string(), 1884));
        assert_eq!(parse_broker_url("broker.local"), ("broker.local".to_string(), 1883));
    }

    #[tokio::test]
    async fn handle_publish_routes_binary_and_text_families() {
        let bus = Arc::new(EventBus::new());
        let ingress = Ingress::new(bus.clone(), MqttConfig::default());
        let mut rx = bus.subscribe_mqtt_message();

        ingress.handle_publish("V5008Upload/DEV001/Heartbeat", &[0xCC, 0x01]);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.protocol_family, ProtocolFamily::V5008);
        assert!(matches!(msg.payload, RawPayload::Binary(_)));

        ingress.handle_publish("V6800Upload/DEV002/u_state_resp", br#"{"msg_type":"u_state_resp"}"#);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.protocol_family, ProtocolFamily::V6800);
        assert!(matches!(msg.payload, RawPayload::Text(_)));
    }

    #[tokio::test]
    async fn handle_publish_drops_unrecognized_topic_and_reports_error() {
        let bus = Arc::new(EventBus::new());
        let ingress = Ingress::new(bus.clone(), MqttConfig::default());
        let mut error_rx = bus.subscribe_error();
        ingress.handle_publish("Other/DEV001/x", b"ignored");
        let event = error_rx.recv().await.unwrap();
        assert_eq!(event.source, "ingress");
    }
}
