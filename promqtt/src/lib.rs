//! Bridge between an MQTT broker and Prometheus.
//!
//! Device telemetry published over MQTT is routed by topic to configured
//! device types. Each type maps message fields to labeled metric values with
//! small sandboxed expressions, and the resulting metrics are served over HTTP
//! in the Prometheus text exposition format.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────┐     ┌────────────────┐     ┌─────────────┐
//! │ MQTT broker  │────>│ BridgeController │────>│ MessageHandler │────>│   Mapping   │
//! │  (rumqttc)   │     │    dispatch()    │     │ topic + parser │     │ value/labels│
//! └──────────────┘     └──────────────────┘     └────────────────┘     └──────┬──────┘
//!                                                                             │ set()
//!                      ┌──────────────────┐     ┌────────────────┐            │
//!                      │   HTTP server    │────>│  MetricStore   │<───────────┘
//!                      │    (/metrics)    │     │ (promqtt-exp.) │
//!                      └──────────────────┘     └────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! promqtt --config promqtt.json5
//! ```
//!
//! See [`config::BridgeConfig`] for configuration options and [`expr`] for the
//! expression language.

pub mod bridge;
pub mod config;
pub mod expr;
pub mod handler;
pub mod http;
pub mod mapping;
pub mod message;
pub mod mqtt;

pub use bridge::{BridgeController, BridgeError, BridgeStats, SharedController};
pub use config::{BridgeConfig, ConfigError};
pub use handler::MessageHandler;
pub use http::HttpServer;
pub use mapping::Mapping;
pub use message::{Message, ParserKind};
pub use mqtt::MqttSubscriber;
