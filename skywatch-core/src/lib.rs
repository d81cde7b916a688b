//! Skywatch core - shared pieces of the sensor ingestion and alerting pipeline
//!
//! - `models` / `codec`: readings, alert events, CSV row and JSON payload codec
//! - `config`: YAML + environment configuration
//! - `connection` / `bus`: broker connection state machine, backoff, rumqttc loop
//! - `rules` / `sink`: threshold rule definitions and the alert sink seam
//! - `shutdown`: interrupt / terminate signal handling shared by both services

pub mod bus;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod models;
pub mod rules;
pub mod shutdown;
pub mod sink;
pub mod state;

pub use bus::{BrokerSession, BusClient, BusEvent, BusEvents, InboundMessage, MqttBus, NetworkLoop};
pub use config::SkywatchConfig;
pub use connection::{Backoff, ConnectionEvent, ConnectionHandle, ConnectionState};
pub use error::{CodecError, ConfigError, ConnectionError, PublishError, SinkError, WatchError};
pub use models::{AlertEvent, Reading, Severity};
pub use rules::{AlertRule, Comparator, RuleProfile};
pub use sink::AlertSink;
