//! middleworker: the single daemon binary
//!
//! Usage:
//!   middleworker                       # looks for ./config.toml
//!   middleworker --config config.toml
//!   middleworker --mqtt-url mqtt://broker:1883 --db-url postgres://...
//!
//! Wires every component onto one `EventBus`/`StateCache` pair and runs them
//! as tokio tasks until Ctrl+C. Every component subscribes to the same
//! shutdown broadcast and races it against its own inbound channel in a
//! `tokio::select!`; each flushes/drains whatever it has already buffered
//! before exiting, but there's no cross-component ordering guarantee beyond
//! that, so a message already in flight downstream of a just-exited
//! component can still be lost.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use iot_middleware_rs::bus::EventBus;
use iot_middleware_rs::cache::StateCache;
use iot_middleware_rs::command_service::CommandService;
use iot_middleware_rs::common::cli::DaemonArgs;
use iot_middleware_rs::common::setup_shutdown;
use iot_middleware_rs::config::Config;
use iot_middleware_rs::feed::CanonicalFeedEmitter;
use iot_middleware_rs::ingress::{parse_broker_url, Ingress};
use iot_middleware_rs::normalizer::Normalizer;
use iot_middleware_rs::parser::ParseStage;
use iot_middleware_rs::status::{self, AppState, ComponentHandles};
use iot_middleware_rs::storage::StorageWriter;
use iot_middleware_rs::watchdog::CacheWatchdog;
use rumqttc::{AsyncClient, MqttOptions};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

fn mqtt_options_for(config: &Config, client_id: &str) -> MqttOptions {
    let (host, port) = parse_broker_url(&config.mqtt.broker_url);
    let mut opts = MqttOptions::new(client_id, host, port);
    opts.set_keep_alive(Duration::from_secs(config.mqtt.options.keepalive_secs));
    opts
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = DaemonArgs::parse();

    let mut config = Config::load(&args.config_file).unwrap_or_else(|err| {
        eprintln!("warning: could not load {}: {err}, using defaults", args.config_file);
        Config::from_toml("mqtt.broker_url = \"mqtt://localhost:1883\"\n").expect("default config parses")
    });
    config.apply_overrides(&args);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("========================================");
    println!("  IoT Middleware (V5008/V6800 -> SUO)");
    println!("========================================");
    println!("  MQTT broker:   {}", config.mqtt.broker_url);
    println!("  DB connection: {}", config.database.connection);
    println!("  Status port:   {}", config.logging.status_port);
    println!("  Press Ctrl+C to stop.");
    println!("========================================");

    let bus = Arc::new(EventBus::new());
    let cache = Arc::new(StateCache::new());

    let db_pool = PgPoolOptions::new()
        .min_connections(config.database.pool.min)
        .max_connections(config.database.pool.max)
        .acquire_timeout(Duration::from_millis(config.database.pool.acquire_timeout_millis))
        .idle_timeout(Duration::from_millis(config.database.pool.idle_timeout_millis))
        .connect(&config.database.connection)
        .await?;

    let (shutdown_tx, _) = setup_shutdown();

    let ingress = Ingress::new(bus.clone(), config.mqtt.clone());
    let parse_stage = ParseStage::new(bus.clone());
    let normalizer = Normalizer::new(cache.clone(), bus.clone(), num_cpus_estimate());
    let storage = StorageWriter::new(db_pool.clone(), bus.clone(), config.storage.clone());
    let watchdog = CacheWatchdog::new(cache.clone(), bus.clone(), config.cache.clone());
    let feed = CanonicalFeedEmitter::with_logging_sink(bus.clone());

    let command_client_id = format!("{}-command", config.mqtt.options.client_id);
    let (command_mqtt_client, mut command_eventloop) =
        AsyncClient::new(mqtt_options_for(&config, &command_client_id), 256);
    tokio::spawn(async move {
        loop {
            if command_eventloop.poll().await.is_err() {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });
    let command_service = CommandService::new(
        cache.clone(),
        bus.clone(),
        command_mqtt_client,
        config.mqtt.download_topic_prefix.clone(),
    );

    let app_state = Arc::new(AppState {
        cache: cache.clone(),
        components: ComponentHandles {
            ingress: ingress.metrics().clone(),
            parser: parse_stage.metrics().clone(),
            normalizer: normalizer.metrics().clone(),
            storage: storage.metrics().clone(),
            watchdog: watchdog.metrics().clone(),
            command_service: command_service.metrics().clone(),
            feed: feed.metrics().clone(),
        },
        db_pool: db_pool.clone(),
    });
    let status_router = status::create_router(app_state);
    let status_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.logging.status_port));

    let mut handles = Vec::new();
    handles.push(tokio::spawn(ingress.run(shutdown_tx.subscribe())));
    handles.push(tokio::spawn(parse_stage.run(shutdown_tx.subscribe())));
    handles.push(tokio::spawn(normalizer.run(shutdown_tx.subscribe())));
    handles.push(tokio::spawn(storage.run(shutdown_tx.subscribe())));
    handles.push(tokio::spawn(watchdog.run(shutdown_tx.subscribe())));
    handles.push(tokio::spawn(command_service.run(shutdown_tx.subscribe())));
    handles.push(tokio::spawn(feed.run(shutdown_tx.subscribe())));

    let mut shutdown_rx_for_http = shutdown_tx.subscribe();
    let listener = tokio::net::TcpListener::bind(status_addr).await?;
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, status_router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx_for_http.recv().await;
            })
            .await
    });

    for handle in handles {
        let _ = handle.await;
    }
    let _ = tokio::time::timeout(SHUTDOWN_DRAIN, http_handle).await;

    db_pool.close().await;
    info!("middleworker stopped");
    Ok(())
}

/// Worker pool size for the normalizer's hash-partitioned device workers.
/// `std::thread::available_parallelism` is the stdlib equivalent of
/// `num_cpus::get()` without pulling in another dependency.
fn num_cpus_estimate() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
