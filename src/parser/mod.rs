//! Protocol parsers: raw wire bytes/text to SIF
//!
//! Each protocol family gets its own parser behind a common capability —
//! `parse(topic, payload) -> Option<Sif>` — so the task that drains
//! `mqtt.message` doesn't need to know which wire format produced a given
//! `RawMessage`. A parser never errors outward: malformed input is logged
//! and yields `None` — no downstream effect on parse failure. Parsing is pure CPU work with no
//! shared state, so unlike the normalizer it needs no per-device
//! serialization — every message can be parsed independently and in
//! parallel.

pub mod v5008;
pub mod v6800;

use std::sync::Arc;

use tracing::warn;

use crate::bus::EventBus;
use crate::common::shutdown::ShutdownReceiver;
use crate::common::{AtomicCounters, MiddlewareResult};
use crate::model::{ProtocolFamily, RawMessage, RawPayload, Sif};

/// A protocol parser: wire bytes/text in, a SIF out, or `None` if the input
/// can't be decoded.
pub trait Parser {
    fn parse(&self, topic: &str, payload: &RawPayload) -> Option<Sif>;
}

/// Dispatch a raw message to the parser for its protocol family.
pub fn parse_raw_message(raw: &RawMessage) -> Option<Sif> {
    let mut sif = match raw.protocol_family {
        ProtocolFamily::V5008 => v5008::V5008Parser.parse(&raw.topic, &raw.payload),
        ProtocolFamily::V6800 => v6800::V6800Parser.parse(&raw.topic, &raw.payload),
    }?;
    sif.meta.topic = raw.topic.clone();
    sif.meta.raw_message_type = raw.raw_message_type.clone();
    sif.meta.received_at = Some(raw.received_at);
    Some(sif)
}

/// Drains `mqtt.message`, parses each one independently (no per-device
/// serialization needed here, unlike the normalizer downstream), and
/// republishes successes on `data.parsed`. Parsing is cheap CPU work, so a
/// single task keeps up without its own worker pool.
pub struct ParseStage {
    bus: Arc<EventBus>,
    metrics: Arc<AtomicCounters>,
}

impl ParseStage {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            metrics: Arc::new(AtomicCounters::new()),
        })
    }

    pub fn metrics(&self) -> &Arc<AtomicCounters> {
        &self.metrics
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: ShutdownReceiver) -> MiddlewareResult<()> {
        let mut rx = self.bus.subscribe_mqtt_message();
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Ok(raw) => self.handle(&raw),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "parse stage lagged behind mqtt.message");
                            self.metrics.add_dropped(skipped);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        Ok(())
    }

    fn handle(&self, raw: &RawMessage) {
        self.metrics.inc_received();
        match parse_raw_message(raw) {
            Some(sif) => {
                self.bus.publish_parsed(sif);
                self.metrics.inc_processed();
            }
            None => {
                self.metrics.inc_dropped();
                self.bus.publish_error(
                    "parser",
                    format!("failed to decode {} message on topic {}", raw.protocol_family.as_str(), raw.topic),
                    None,
                );
            }
        }
    }
}
