//! Bidirectional MQTT <-> SQL bridge
//!
//! The bridge runs two independent halves against one MQTT broker and one
//! PostgreSQL database:
//!
//! - **Receiver**: subscribes to the topic patterns of the enabled routes,
//!   decodes each message, and writes it to every matching target table
//!   (direct `INSERT` or stored procedure), in priority order.
//! - **Publisher**: polls source tables for rows that have not been sent yet,
//!   publishes each as a JSON message and records the delivery so it is never
//!   selected again.
//!
//! Routing and publishing rules come from a [`store::ConfigStore`] (SQL
//! tables or a TOML rules file) and are hot reloaded whenever the number of
//! enabled rules changes.
//!
//! # Example Configuration
//!
//! ```toml
//! [mqtt]
//! broker_host = "localhost"
//! broker_port = 1883
//! client_id = "mqtt-bridge"
//!
//! [database]
//! connection_string = "host=localhost user=bridge dbname=telemetry"
//!
//! [publisher]
//! scheduling = "Parallel"
//! max_retry_attempts = 3
//!
//! [config_store]
//! kind = "File"
//! path = "rules.toml"
//! ```

pub mod audit;
pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod insert;
pub mod mapper;
pub mod model;
pub mod poller;
pub mod publisher;
pub mod receiver;
pub mod reload;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod topic;
pub mod tracker;
pub mod value;

#[cfg(test)]
mod testing;

pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use model::{QoS, RouteConfig, SourceConfig, TableMapping};
pub use value::{FieldMap, FieldValue};
