//! Canonical Feed Emitter: the boundary to the out-of-scope WS/HTTP collaborator
//!
//! This component's entire job is handing every SUO, serialized as
//! JSON, to whatever external server fans it out to dashboards — that
//! server's framing (`{type:"data", data:<SUO>}`) and its WS/HTTP transport
//! are out of scope here. The emitter is expressed purely as the boundary:
//! a `data.normalized` subscriber plus a small [`FeedSink`] trait any
//! concrete transport can implement, with a default sink (`LoggingSink`)
//! that counts and logs.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::common::shutdown::ShutdownReceiver;
use crate::common::{AtomicCounters, MiddlewareResult};
use crate::model::Suo;

/// Where a serialized SUO goes once the emitter has it. The real WS/HTTP
/// fan-out to browsers is an external collaborator; this trait is
/// the seam a concrete implementation of that collaborator would plug into.
pub trait FeedSink: Send + Sync {
    fn publish(&self, serialized: &str);
}

/// Default sink: counts and logs at debug level. Enough to exercise the
/// emitter end-to-end without standing up a real WS server.
pub struct LoggingSink;

impl FeedSink for LoggingSink {
    fn publish(&self, serialized: &str) {
        debug!(bytes = serialized.len(), "canonical feed: suo");
    }
}

pub struct CanonicalFeedEmitter {
    bus: Arc<EventBus>,
    sink: Arc<dyn FeedSink>,
    metrics: Arc<AtomicCounters>,
}

impl CanonicalFeedEmitter {
    pub fn new(bus: Arc<EventBus>, sink: Arc<dyn FeedSink>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            sink,
            metrics: Arc::new(AtomicCounters::new()),
        })
    }

    pub fn with_logging_sink(bus: Arc<EventBus>) -> Arc<Self> {
        Self::new(bus, Arc::new(LoggingSink))
    }

    pub fn metrics(&self) -> &Arc<AtomicCounters> {
        &self.metrics
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: ShutdownReceiver) -> MiddlewareResult<()> {
        let mut rx = self.bus.subscribe_normalized();
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Ok(suo) => self.emit(&suo),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "canonical feed emitter lagged behind data.normalized");
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

    fn emit(&self, suo: &Suo) {
        self.metrics.inc_received();
        match serde_json::to_string(suo) {
            Ok(serialized) => {
                self.sink.publish(&serialized);
                self.metrics.inc_processed();
            }
            Err(err) => {
                warn!(error = %err, "failed to serialize SUO for canonical feed");
                self.metrics.inc_dropped();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageType;
    use parking_lot::Mutex;

    struct CapturingSink(Mutex<Vec<String>>);

    impl FeedSink for CapturingSink {
        fn publish(&self, serialized: &str) {
            self.0.lock().push(serialized.to_string());
        }
    }

    #[test]
    fn emit_hands_serialized_suo_to_sink() {
        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(CapturingSink(Mutex::new(Vec::new())));
        let emitter = CanonicalFeedEmitter::new(bus, sink.clone());
        let suo = Suo::new(MessageType::Heartbeat, "m-1", "dev-1", "V5008");
        emitter.emit(&suo);
        let captured = sink.0.lock();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].contains("\"device_id\":\"dev-1\""));
    }

    #[tokio::test]
    async fn run_drains_normalized_topic_until_shutdown() {
        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(CapturingSink(Mutex::new(Vec::new())));
        let emitter = CanonicalFeedEmitter::new(bus.clone(), sink.clone());
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        let handle = tokio::spawn(emitter.run(shutdown_rx));
        bus.publish_normalized(Suo::new(MessageType::Heartbeat, "m-1", "dev-1", "V5008"));
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(sink.0.lock().len(), 1);
    }
}
