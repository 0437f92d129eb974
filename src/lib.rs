//! iot-middleware-rs: ingest-to-canonical-event middleware for cabinet/rack
//! gateway telemetry
//!
//! V5008 binary and V6800 JSON messages arrive over MQTT, get parsed into a
//! common intermediate form, diffed against in-memory device state, and
//! published both as a canonical SUO event stream and a relational
//! historical record.

pub mod bus;
pub mod cache;
pub mod command_service;
pub mod common;
pub mod config;
pub mod feed;
pub mod ingress;
pub mod model;
pub mod normalizer;
pub mod parser;
pub mod status;
pub mod storage;
pub mod watchdog;
