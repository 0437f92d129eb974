//! CLI argument parsing for the middleware daemon
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Flags are overrides: the config file is loaded first, then each
//!   present flag replaces the corresponding field, matching
//!   `Config::apply_overrides` in `crate::config`.

use clap::Parser;

/// Arguments for the `middleworker` daemon binary
#[derive(Parser, Debug, Clone)]
#[command(name = "middleworker", about = "V5008/V6800 IoT telemetry middleware")]
pub struct DaemonArgs {
    /// Path to configuration file
    #[arg(short = 'f', long = "config", default_value = "config.toml")]
    pub config_file: String,

    /// Override `mqtt.broker_url`
    #[arg(long)]
    pub mqtt_url: Option<String>,

    /// Override `mqtt.options.client_id`
    #[arg(long)]
    pub mqtt_client_id: Option<String>,

    /// Override `database.connection` (a Postgres URL)
    #[arg(long)]
    pub db_url: Option<String>,

    /// Override `logging.level` (e.g. "info", "debug,iot_middleware_rs=trace")
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override the status/health HTTP surface's bind port
    #[arg(long)]
    pub status_port: Option<u16>,
}
