//! Route handlers for the status/metrics surface

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::common::metrics::CounterSnapshot;
use crate::storage::pool_is_healthy;

use super::AppState;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ComponentStatus {
    pub name: String,
    pub counters: CounterSnapshot,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SystemStatus {
    pub components: Vec<ComponentStatus>,
    pub device_count: usize,
    pub database_healthy: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MetricsResponse {
    pub components: Vec<ComponentStatus>,
}

fn component_snapshots(state: &AppState) -> Vec<ComponentStatus> {
    vec![
        ComponentStatus {
            name: "ingress".to_string(),
            counters: state.components.ingress.snapshot(),
        },
        ComponentStatus {
            name: "parser".to_string(),
            counters: state.components.parser.snapshot(),
        },
        ComponentStatus {
            name: "normalizer".to_string(),
            counters: state.components.normalizer.snapshot(),
        },
        ComponentStatus {
            name: "storage".to_string(),
            counters: state.components.storage.snapshot(),
        },
        ComponentStatus {
            name: "watchdog".to_string(),
            counters: state.components.watchdog.snapshot(),
        },
        ComponentStatus {
            name: "command_service".to_string(),
            counters: state.components.command_service.snapshot(),
        },
        ComponentStatus {
            name: "feed".to_string(),
            counters: state.components.feed.snapshot(),
        },
    ]
}

/// Per-component counters plus the aggregate device count and database
/// reachability.
#[utoipa::path(
    get,
    path = "/status",
    tag = "Status",
    responses(
        (status = 200, description = "System status", body = SystemStatus)
    )
)]
pub(super) async fn get_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let database_healthy = pool_is_healthy(&state.db_pool).await;
    Json(SystemStatus {
        components: component_snapshots(&state),
        device_count: state.cache.device_ids().len(),
        database_healthy,
    })
}

/// Raw counter snapshots for every component with a registered handle.
#[utoipa::path(
    get,
    path = "/metrics",
    tag = "Status",
    responses(
        (status = 200, description = "Component counters", body = MetricsResponse)
    )
)]
pub(super) async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        components: component_snapshots(&state),
    })
}

#[derive(OpenApi)]
#[openapi(
    paths(get_status, get_metrics),
    components(schemas(SystemStatus, MetricsResponse, ComponentStatus, CounterSnapshot)),
    tags((name = "Status", description = "Operational status and metrics"))
)]
struct ApiDoc;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .with_state(state)
}
