//! Status/health HTTP surface
//!
//! One small ambient axum server: `GET /status` for per-component online
//! state plus the database pool's health, and `GET /metrics` for the raw
//! atomic counters each component already tracks. This is not the canonical
//! feed — it never carries SUO payloads, only operational state for anyone
//! running this process.

pub mod routes;

use std::sync::Arc;

use sqlx::PgPool;

use crate::cache::StateCache;
use crate::common::AtomicCounters;

/// Named handles to the counters each long-running component exposes.
/// Any component without a handle here is simply omitted from `/status`
/// and `/metrics` rather than causing either route to fail.
pub struct ComponentHandles {
    pub ingress: Arc<AtomicCounters>,
    pub parser: Arc<AtomicCounters>,
    pub normalizer: Arc<AtomicCounters>,
    pub storage: Arc<AtomicCounters>,
    pub watchdog: Arc<AtomicCounters>,
    pub command_service: Arc<AtomicCounters>,
    pub feed: Arc<AtomicCounters>,
}

pub struct AppState {
    pub cache: Arc<StateCache>,
    pub components: ComponentHandles,
    pub db_pool: PgPool,
}

pub fn create_router(state: Arc<AppState>) -> axum::Router {
    routes::create_router(state)
}
