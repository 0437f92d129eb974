//! Storage writer: batched, pivoted persistence of SUO events
//!
//! Subscribes to `data.normalized` and routes each SUO into a per-table
//! in-memory buffer. A buffer flushes when it hits `batch_size`, when the
//! shared interval timer fires, or on shutdown — each flush is one
//! multi-row insert/upsert per table, following the runtime query-builder
//! style (`sqlx::query(...).bind(...)`) rather than the compile-time
//! `query!` macro, since the latter needs a reachable database at build
//! time and every table here is pivoted or JSON-shaped in a way the macro
//! can't check anyway.
//!
//! A failed flush never panics or drops in-flight data silently: it logs,
//! republishes on `error`, and keeps the buffer for the next interval,
//! bounded by `max_buffered_per_table` (oldest rows are dropped first —
//! "keep last N" rather than unbounded growth).

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{error, warn};

use crate::bus::EventBus;
use crate::common::shutdown::ShutdownReceiver;
use crate::common::{AtomicCounters, MiddlewareResult};
use crate::config::StorageConfig;
use crate::model::{MessageType, Suo};

const TEMP_HUM_INDICES: [u32; 6] = [10, 11, 12, 13, 14, 15];
const NOISE_INDICES: [u32; 3] = [16, 17, 18];

#[derive(Default)]
struct Buffers {
    meta_data: Vec<Suo>,
    heartbeat: Vec<Suo>,
    rfid_snapshot: Vec<Suo>,
    rfid_event: Vec<Suo>,
    temp_hum: Vec<Suo>,
    noise_level: Vec<Suo>,
    door_state: Vec<Suo>,
    cmd_result: Vec<Suo>,
    topchange_event: Vec<Suo>,
}

impl Buffers {
    fn push(&mut self, suo: Suo, max_buffered: usize) {
        let buf = match suo.message_type {
            MessageType::DeviceMetadata => &mut self.meta_data,
            MessageType::Heartbeat => &mut self.heartbeat,
            MessageType::RfidSnapshot => &mut self.rfid_snapshot,
            MessageType::RfidEvent => &mut self.rfid_event,
            MessageType::TempHum | MessageType::QryTempHumResp => &mut self.temp_hum,
            MessageType::NoiseLevel => &mut self.noise_level,
            MessageType::DoorState | MessageType::QryDoorStateResp => &mut self.door_state,
            MessageType::QryClrResp | MessageType::SetClrResp | MessageType::ClnAlmResp => &mut self.cmd_result,
            MessageType::MetaChangedEvent => &mut self.topchange_event,
            MessageType::Unknown
            | MessageType::DeviceInfo
            | MessageType::ModuleInfo
            | MessageType::DevModInfo
            | MessageType::UtotalChanged => {
                warn!(device_id = %suo.device_id, message_type = ?suo.message_type, "dropping SUO: no storage route");
                return;
            }
        };
        buf.push(suo);
        if buf.len() > max_buffered {
            let overflow = buf.len() - max_buffered;
            buf.drain(0..overflow);
        }
    }

    fn any_at_capacity(&self, batch_size: usize) -> bool {
        [
            &self.meta_data,
            &self.heartbeat,
            &self.rfid_snapshot,
            &self.rfid_event,
            &self.temp_hum,
            &self.noise_level,
            &self.door_state,
            &self.cmd_result,
            &self.topchange_event,
        ]
        .iter()
        .any(|b| b.len() >= batch_size)
    }
}

/// Storage writer task. Owns the connection pool and per-table buffers;
/// `bus` is the same process-wide collaborator every other component gets.
pub struct StorageWriter {
    pool: PgPool,
    bus: Arc<EventBus>,
    config: StorageConfig,
    buffers: Mutex<Buffers>,
    metrics: Arc<AtomicCounters>,
}

impl StorageWriter {
    pub fn new(pool: PgPool, bus: Arc<EventBus>, config: StorageConfig) -> Arc<Self> {
        Arc::new(Self {
            pool,
            bus,
            config,
            buffers: Mutex::new(Buffers::default()),
            metrics: Arc::new(AtomicCounters::new()),
        })
    }

    pub fn metrics(&self) -> &Arc<AtomicCounters> {
        &self.metrics
    }

    fn allowed(&self, message_type: MessageType) -> bool {
        if self.config.filters.is_empty() {
            return true;
        }
        let label = serde_json::to_value(message_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.config.filters.iter().any(|f| f == &label)
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: ShutdownReceiver) -> MiddlewareResult<()> {
        let mut normalized_rx = self.bus.subscribe_normalized();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(self.config.flush_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = normalized_rx.recv() => {
                    match msg {
                        Ok(suo) => {
                            self.metrics.inc_received();
                            if !self.allowed(suo.message_type) {
                                self.metrics.inc_dropped();
                                continue;
                            }
                            let at_capacity = {
                                let mut buffers = self.buffers.lock();
                                buffers.push((*suo).clone(), self.config.max_buffered_per_table);
                                buffers.any_at_capacity(self.config.batch_size)
                            };
                            if at_capacity {
                                self.flush_all().await;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "storage writer lagged behind data.normalized");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = ticker.tick() => {
                    self.flush_all().await;
                }
                _ = shutdown_rx.recv() => {
                    self.flush_all().await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn flush_all(&self) {
        let (meta_data, heartbeat, rfid_snapshot, rfid_event, temp_hum, noise_level, door_state, cmd_result, topchange_event) = {
            let mut buffers = self.buffers.lock();
            (
                std::mem::take(&mut buffers.meta_data),
                std::mem::take(&mut buffers.heartbeat),
                std::mem::take(&mut buffers.rfid_snapshot),
                std::mem::take(&mut buffers.rfid_event),
                std::mem::take(&mut buffers.temp_hum),
                std::mem::take(&mut buffers.noise_level),
                std::mem::take(&mut buffers.door_state),
                std::mem::take(&mut buffers.cmd_result),
                std::mem::take(&mut buffers.topchange_event),
            )
        };

        self.flush_guarded("iot_meta_data", &meta_data, flush_meta_data).await;
        self.flush_guarded("iot_heartbeat", &heartbeat, flush_heartbeat).await;
        self.flush_guarded("iot_rfid_snapshot", &rfid_snapshot, flush_rfid_snapshot).await;
        self.flush_guarded("iot_rfid_event", &rfid_event, flush_rfid_event).await;
        self.flush_guarded("iot_temp_hum", &temp_hum, flush_temp_hum).await;
        self.flush_guarded("iot_noise_level", &noise_level, flush_noise_level).await;
        self.flush_guarded("iot_door_event", &door_state, flush_door_state).await;
        self.flush_guarded("iot_cmd_result", &cmd_result, flush_cmd_result).await;
        self.flush_guarded("iot_topchange_event", &topchange_event, flush_topchange_event).await;
    }

    /// Runs one table's flush function; on failure, logs, republishes on
    /// `error`, and puts the batch back at the front of the buffer so it's
    /// retried next interval (still bounded by `max_buffered_per_table`).
    ///
    /// A failed batch is NOT counted as dropped here: it's retained for
    /// retry, and a later successful flush will count it as processed. Only
    /// rows actually evicted by the `max_buffered_per_table` trim are
    /// dropped, so `processed + dropped` doesn't double-count retried rows.
    async fn flush_guarded<F, Fut>(&self, table: &'static str, batch: &[Suo], f: F)
    where
        F: FnOnce(PgPool, Vec<Suo>) -> Fut,
        Fut: std::future::Future<Output = Result<(), sqlx::Error>>,
    {
        if batch.is_empty() {
            return;
        }
        let pool = self.pool.clone();
        let owned = batch.to_vec();
        if let Err(err) = f(pool, owned).await {
            error!(table, error = %err, "storage flush failed, retaining buffer for retry");
            self.bus.publish_error(
                "storage",
                format!("flush of {table} failed: {err}"),
                Some(serde_json::json!({"table": table, "rows": batch.len()})),
            );
            let mut buffers = self.buffers.lock();
            let target = match table {
                "iot_meta_data" => &mut buffers.meta_data,
                "iot_heartbeat" => &mut buffers.heartbeat,
                "iot_rfid_snapshot" => &mut buffers.rfid_snapshot,
                "iot_rfid_event" => &mut buffers.rfid_event,
                "iot_temp_hum" => &mut buffers.temp_hum,
                "iot_noise_level" => &mut buffers.noise_level,
                "iot_door_event" => &mut buffers.door_state,
                "iot_cmd_result" => &mut buffers.cmd_result,
                "iot_topchange_event" => &mut buffers.topchange_event,
                _ => return,
            };
            let mut restored = batch.to_vec();
            restored.extend(std::mem::take(target));
            if restored.len() > self.config.max_buffered_per_table {
                let overflow = restored.len() - self.config.max_buffered_per_table;
                restored.drain(0..overflow);
                self.metrics.add_dropped(overflow as u64);
            }
            *target = restored;
        } else {
            self.metrics.add_processed(batch.len() as u64);
        }
    }
}

async fn flush_meta_data(pool: PgPool, batch: Vec<Suo>) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for suo in batch {
        let payload = suo.payload.first().cloned().unwrap_or(Value::Null);
        sqlx::query(
            r#"INSERT INTO iot_meta_data (device_id, device_type, device_ip, device_mac, fw_ver, mask, gw_ip, active_modules, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (device_id) DO UPDATE SET
                 device_type = EXCLUDED.device_type,
                 device_ip = EXCLUDED.device_ip,
                 device_mac = EXCLUDED.device_mac,
                 fw_ver = EXCLUDED.fw_ver,
                 mask = EXCLUDED.mask,
                 gw_ip = EXCLUDED.gw_ip,
                 active_modules = EXCLUDED.active_modules,
                 updated_at = EXCLUDED.updated_at"#,
        )
        .bind(&suo.device_id)
        .bind(payload.get("deviceType").and_then(Value::as_str))
        .bind(payload.get("ip").and_then(Value::as_str))
        .bind(payload.get("mac").and_then(Value::as_str))
        .bind(payload.get("fwVer").and_then(Value::as_str))
        .bind(payload.get("mask").and_then(Value::as_str))
        .bind(payload.get("gwIp").and_then(Value::as_str))
        .bind(payload.get("activeModules").cloned().unwrap_or(Value::Array(vec![])))
        .bind(suo.occurred_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

async fn flush_heartbeat(pool: PgPool, batch: Vec<Suo>) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for suo in batch {
        let modules = Value::Array(suo.payload.clone());
        sqlx::query(
            "INSERT INTO iot_heartbeat (device_id, message_id, active_modules, occurred_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&suo.device_id)
        .bind(&suo.message_id)
        .bind(modules)
        .bind(suo.occurred_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

async fn flush_rfid_snapshot(pool: PgPool, batch: Vec<Suo>) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for suo in batch {
        sqlx::query(
            "INSERT INTO iot_rfid_snapshot (device_id, module_index, message_id, snapshot, occurred_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&suo.device_id)
        .bind(suo.module_index.map(|i| i as i32))
        .bind(&suo.message_id)
        .bind(Value::Array(suo.payload.clone()))
        .bind(suo.occurred_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

async fn flush_rfid_event(pool: PgPool, batch: Vec<Suo>) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for suo in &batch {
        for entry in &suo.payload {
            sqlx::query(
                "INSERT INTO iot_rfid_event (device_id, module_index, message_id, sensor_index, tag_id, action, alarm, occurred_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&suo.device_id)
            .bind(suo.module_index.map(|i| i as i32))
            .bind(&suo.message_id)
            .bind(entry.get("sensorIndex").and_then(Value::as_i64))
            .bind(entry.get("tagId").and_then(Value::as_str))
            .bind(entry.get("action").and_then(Value::as_str))
            .bind(entry.get("isAlarm").and_then(Value::as_bool).unwrap_or(false))
            .bind(suo.occurred_at)
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await
}

/// Pivots a module's variable-length temp/hum reading array into fixed
/// `(temp, hum)` pairs for sensor indices 10..15, leaving absent indices
/// `None` so they land as SQL NULL.
fn pivot_temp_hum(suo: &Suo) -> [(Option<f64>, Option<f64>); 6] {
    let mut columns = [(None, None); 6];
    for entry in &suo.payload {
        let Some(sensor_index) = entry.get("sensorIndex").and_then(Value::as_u64) else { continue };
        if let Some(pos) = TEMP_HUM_INDICES.iter().position(|i| *i as u64 == sensor_index) {
            columns[pos] = (
                entry.get("temp").and_then(Value::as_f64),
                entry.get("hum").and_then(Value::as_f64),
            );
        }
    }
    columns
}

fn pivot_noise(suo: &Suo) -> [Option<f64>; 3] {
    let mut columns = [None; 3];
    for entry in &suo.payload {
        let Some(sensor_index) = entry.get("sensorIndex").and_then(Value::as_u64) else { continue };
        if let Some(pos) = NOISE_INDICES.iter().position(|i| *i as u64 == sensor_index) {
            columns[pos] = entry.get("noise").and_then(Value::as_f64);
        }
    }
    columns
}

async fn flush_temp_hum(pool: PgPool, batch: Vec<Suo>) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for suo in &batch {
        let cols = pivot_temp_hum(suo);
        sqlx::query(
            r#"INSERT INTO iot_temp_hum
                 (device_id, module_index, message_id,
                  temp_index10, hum_index10, temp_index11, hum_index11,
                  temp_index12, hum_index12, temp_index13, hum_index13,
                  temp_index14, hum_index14, temp_index15, hum_index15,
                  occurred_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"#,
        )
        .bind(&suo.device_id)
        .bind(suo.module_index.map(|i| i as i32))
        .bind(&suo.message_id)
        .bind(cols[0].0)
        .bind(cols[0].1)
        .bind(cols[1].0)
        .bind(cols[1].1)
        .bind(cols[2].0)
        .bind(cols[2].1)
        .bind(cols[3].0)
        .bind(cols[3].1)
        .bind(cols[4].0)
        .bind(cols[4].1)
        .bind(cols[5].0)
        .bind(cols[5].1)
        .bind(suo.occurred_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

async fn flush_noise_level(pool: PgPool, batch: Vec<Suo>) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for suo in &batch {
        let cols = pivot_noise(suo);
        sqlx::query(
            "INSERT INTO iot_noise_level (device_id, module_index, message_id, noise_index16, noise_index17, noise_index18, occurred_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&suo.device_id)
        .bind(suo.module_index.map(|i| i as i32))
        .bind(&suo.message_id)
        .bind(cols[0])
        .bind(cols[1])
        .bind(cols[2])
        .bind(suo.occurred_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

async fn flush_door_state(pool: PgPool, batch: Vec<Suo>) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for suo in &batch {
        let Some(entry) = suo.payload.first() else { continue };
        sqlx::query(
            "INSERT INTO iot_door_event (device_id, module_index, message_id, doorState, door1State, door2State, occurred_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&suo.device_id)
        .bind(suo.module_index.map(|i| i as i32))
        .bind(&suo.message_id)
        .bind(entry.get("doorState").and_then(Value::as_i64))
        .bind(entry.get("door1State").and_then(Value::as_i64))
        .bind(entry.get("door2State").and_then(Value::as_i64))
        .bind(suo.occurred_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

async fn flush_cmd_result(pool: PgPool, batch: Vec<Suo>) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for suo in &batch {
        let Some(entry) = suo.payload.first() else { continue };
        sqlx::query(
            "INSERT INTO iot_cmd_result (device_id, message_id, cmd, result, original_req, color_map, occurred_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&suo.device_id)
        .bind(&suo.message_id)
        .bind(serde_json::to_value(suo.message_type).ok().and_then(|v| v.as_str().map(str::to_string)))
        .bind(entry.get("result").cloned())
        .bind(entry.get("originalReq").cloned())
        .bind(entry.get("colorMap").cloned())
        .bind(suo.occurred_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

async fn flush_topchange_event(pool: PgPool, batch: Vec<Suo>) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for suo in &batch {
        for description in &suo.payload {
            let Some(text) = description.as_str() else { continue };
            sqlx::query("INSERT INTO iot_topchange_event (device_id, device_type, message_id, event_desc, occurred_at) VALUES ($1, $2, $3, $4, $5)")
                .bind(&suo.device_id)
                .bind(&suo.device_type)
                .bind(&suo.message_id)
                .bind(text)
                .bind(suo.occurred_at)
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await
}

/// Cheap liveness probe used by the status surface's health check.
pub async fn pool_is_healthy(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").fetch_one(pool).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageType;

    fn temp_hum_suo(readings: &[(u32, f64, f64)]) -> Suo {
        let mut suo = Suo::new(MessageType::TempHum, "m-1", "dev-1", "V5008");
        suo.payload = readings
            .iter()
            .map(|(idx, temp, hum)| serde_json::json!({"sensorIndex": idx, "temp": temp, "hum": hum}))
            .collect();
        suo
    }

    #[test]
    fn pivot_temp_hum_places_values_at_correct_offsets() {
        let suo = temp_hum_suo(&[(10, 22.5, 50.0), (13, 18.0, 44.5)]);
        let cols = pivot_temp_hum(&suo);
        assert_eq!(cols[0], (Some(22.5), Some(50.0)));
        assert_eq!(cols[3], (Some(18.0), Some(44.5)));
        assert_eq!(cols[1], (None, None));
    }

    #[test]
    fn pivot_noise_places_values_at_correct_offsets() {
        let mut suo = Suo::new(MessageType::NoiseLevel, "m-1", "dev-1", "V5008");
        suo.payload = vec![serde_json::json!({"sensorIndex": 17, "noise": 40.2})];
        let cols = pivot_noise(&suo);
        assert_eq!(cols, [None, Some(40.2), None]);
    }

    #[test]
    fn buffers_push_routes_by_message_type() {
        let mut buffers = Buffers::default();
        buffers.push(Suo::new(MessageType::Heartbeat, "m-1", "dev-1", "V5008"), 100);
        buffers.push(Suo::new(MessageType::TempHum, "m-2", "dev-1", "V5008"), 100);
        assert_eq!(buffers.heartbeat.len(), 1);
        assert_eq!(buffers.temp_hum.len(), 1);
    }

    #[test]
    fn buffers_push_drops_unknown_silently() {
        let mut buffers = Buffers::default();
        buffers.push(Suo::new(MessageType::Unknown, "m-1", "dev-1", "V5008"), 100);
        assert_eq!(buffers.meta_data.len(), 0);
    }

    #[test]
    fn buffers_bound_by_max_buffered_per_table() {
        let mut buffers = Buffers::default();
        for i in 0..5 {
            buffers.push(Suo::new(MessageType::Heartbeat, format!("m-{i}"), "dev-1", "V5008"), 3);
        }
        assert_eq!(buffers.heartbeat.len(), 3);
        assert_eq!(buffers.heartbeat[0].message_id, "m-2");
    }
}
