//! In-process event bus connecting every pipeline component
//!
//! The pipeline is wired as a small number of named topics rather than a
//! generic string-keyed registry: each topic carries exactly one event type,
//! so subscribers get a typed channel instead of a `dyn Any` they have to
//! downcast. `tokio::sync::broadcast` fans a publish out to every
//! subscriber's own queue, so one slow or lagging subscriber never blocks
//! another.
//!
//! A dropped/overflowed receiver only affects that one subscriber (it sees
//! `RecvError::Lagged` and can resync); it never affects publishers or
//! other subscribers.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::model::{CommandRequest, PipelineErrorEvent, RawMessage, Sif, Suo};

/// Channel capacity for each topic. Generous enough to absorb a burst from
/// a slow subscriber without forcing a resync under normal load.
const TOPIC_CAPACITY: usize = 4096;

/// The set of named topics flowing through the pipeline.
pub struct EventBus {
    mqtt_message: broadcast::Sender<Arc<RawMessage>>,
    data_parsed: broadcast::Sender<Arc<Sif>>,
    data_normalized: broadcast::Sender<Arc<Suo>>,
    command_request: broadcast::Sender<Arc<CommandRequest>>,
    error: broadcast::Sender<Arc<PipelineErrorEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            mqtt_message: broadcast::channel(capacity).0,
            data_parsed: broadcast::channel(capacity).0,
            data_normalized: broadcast::channel(capacity).0,
            command_request: broadcast::channel(capacity).0,
            error: broadcast::channel(capacity).0,
        }
    }

    /// Publish to `mqtt.message`. Returns the number of live subscribers,
    /// mirroring `broadcast::Sender::send`'s semantics (a send with zero
    /// subscribers still succeeds, it's just a no-op).
    pub fn publish_mqtt_message(&self, msg: RawMessage) -> usize {
        self.mqtt_message.send(Arc::new(msg)).unwrap_or(0)
    }

    pub fn subscribe_mqtt_message(&self) -> broadcast::Receiver<Arc<RawMessage>> {
        self.mqtt_message.subscribe()
    }

    /// Publish to `data.parsed`.
    pub fn publish_parsed(&self, sif: Sif) -> usize {
        self.data_parsed.send(Arc::new(sif)).unwrap_or(0)
    }

    pub fn subscribe_parsed(&self) -> broadcast::Receiver<Arc<Sif>> {
        self.data_parsed.subscribe()
    }

    /// Publish to `data.normalized`.
    pub fn publish_normalized(&self, suo: Suo) -> usize {
        self.data_normalized.send(Arc::new(suo)).unwrap_or(0)
    }

    pub fn subscribe_normalized(&self) -> broadcast::Receiver<Arc<Suo>> {
        self.data_normalized.subscribe()
    }

    /// Publish to `command.request`.
    pub fn publish_command_request(&self, cmd: CommandRequest) -> usize {
        self.command_request.send(Arc::new(cmd)).unwrap_or(0)
    }

    pub fn subscribe_command_request(&self) -> broadcast::Receiver<Arc<CommandRequest>> {
        self.command_request.subscribe()
    }

    /// Publish to `error`. Every component that can fail mid-stream reports
    /// here rather than propagating a `Result` across the bus boundary,
    /// since a parse or storage failure for one message must not stop the
    /// pipeline for the next one.
    pub fn publish_error(&self, source: &'static str, message: impl Into<String>, context: Option<serde_json::Value>) {
        let event = PipelineErrorEvent {
            source,
            message: message.into(),
            context,
        };
        let _ = self.error.send(Arc::new(event));
    }

    pub fn subscribe_error(&self) -> broadcast::Receiver<Arc<PipelineErrorEvent>> {
        self.error.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageType, ProtocolFamily, RawPayload};
    use chrono::Utc;

    fn sample_raw() -> RawMessage {
        RawMessage {
            protocol_family: ProtocolFamily::V6800,
            device_id: "dev-1".to_string(),
            raw_message_type: "heartbeat".to_string(),
            topic: "V6800Upload/dev-1/heartbeat".to_string(),
            payload: RawPayload::Text("{}".to_string()),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_then_subscribe_delivers_message() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_mqtt_message();
        bus.publish_mqtt_message(sample_raw());
        let got = rx.recv().await.unwrap();
        assert_eq!(got.device_id, "dev-1");
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_a_copy() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe_mqtt_message();
        let mut rx2 = bus.subscribe_mqtt_message();
        bus.publish_mqtt_message(sample_raw());
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish_parsed(Sif::new("V5008", "dev-1", MessageType::Heartbeat));
    }

    #[tokio::test]
    async fn error_topic_carries_source_and_context() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_error();
        bus.publish_error("parser.v5008", "bad frame length", Some(serde_json::json!({"len": 3})));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, "parser.v5008");
        assert_eq!(event.message, "bad frame length");
    }
}
