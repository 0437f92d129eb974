//! Cache watchdog: the only component that manufactures transitions from absence
//!
//! Every other component reacts to a message; the watchdog reacts to the
//! lack of one. A periodic scan flips a telemetry entry offline once its
//! last heartbeat is older than `offlineThreshold`, emitting a
//! DEVICE_METADATA SUO so downstream consumers see the transition exactly
//! once — the `was_online` check below is what keeps a device stuck offline
//! from re-emitting every scan tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::bus::EventBus;
use crate::cache::StateCache;
use crate::common::shutdown::ShutdownReceiver;
use crate::common::{AtomicCounters, MiddlewareResult};
use crate::config::CacheConfig;
use crate::model::{MessageType, Suo};

pub struct CacheWatchdog {
    cache: Arc<StateCache>,
    bus: Arc<EventBus>,
    config: CacheConfig,
    metrics: Arc<AtomicCounters>,
}

impl CacheWatchdog {
    pub fn new(cache: Arc<StateCache>, bus: Arc<EventBus>, config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            cache,
            bus,
            config,
            metrics: Arc::new(AtomicCounters::new()),
        })
    }

    pub fn metrics(&self) -> &Arc<AtomicCounters> {
        &self.metrics
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: ShutdownReceiver) -> MiddlewareResult<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.watchdog_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan();
                }
                _ = shutdown_rx.recv() => {
                    info!("cache watchdog shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    fn scan(&self) {
        let now = Utc::now();
        let threshold = chrono::Duration::seconds(self.config.offline_threshold_secs as i64);
        for key in self.cache.telemetry_keys() {
            let transitioned = self.cache.with_telemetry_mut(&key.device_id, key.module_index, |entry| {
                let stale = entry
                    .last_seen_hb
                    .map(|last| now - last > threshold)
                    .unwrap_or(false);
                if stale && entry.is_online {
                    entry.is_online = false;
                    true
                } else {
                    false
                }
            });
            if transitioned {
                self.metrics.inc_processed();
                self.emit_offline_transition(&key.device_id);
            }
        }
    }

    fn emit_offline_transition(&self, device_id: &str) {
        let Some(meta) = self.cache.metadata_snapshot(device_id) else {
            return;
        };
        let mut suo = Suo::new(MessageType::DeviceMetadata, format!("watchdog-{device_id}-{}", Utc::now().timestamp_millis()), device_id, meta.device_type.clone());
        suo.payload = vec![json!({
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
            "isOnline": false,
        })];
        self.bus.publish_normalized(suo);
    }
}
