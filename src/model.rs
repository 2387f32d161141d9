//! Routing and publishing configuration records, plus delivery facts.
//!
//! These are loaded from the configuration store as immutable snapshots and
//! shared read-only with the workers.

use crate::error::{BridgeError, BridgeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// MQTT Quality of Service level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)] // MQTT spec naming convention
pub enum QoS {
    /// At most once delivery
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    /// Convert a numeric QoS level as stored in configuration tables
    pub fn from_level(level: i64) -> BridgeResult<Self> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(BridgeError::config(format!("Invalid QoS level: {}", other))),
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

fn default_qos() -> QoS {
    QoS::AtLeastOnce
}

fn default_true() -> bool {
    true
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_message_format() -> String {
    "JSON".to_string()
}

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_where_clause() -> String {
    "1=1".to_string()
}

/// Rows fetched per tick when a source does not say otherwise
pub const DEFAULT_BATCH_SIZE: u32 = 1000;

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

fn default_poll_interval_secs() -> u64 {
    5
}

/// How a table mapping writes its row
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum InsertMode {
    /// Parameterized INSERT over the resolved columns
    #[default]
    Direct,
    /// Call a stored procedure with its declared input parameters
    #[serde(alias = "StoredProcedure")]
    StoredProc,
}

/// One write target of a route
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableMapping {
    #[serde(default = "default_schema")]
    pub target_schema: String,

    pub target_table: String,

    #[serde(default)]
    pub insert_mode: InsertMode,

    /// Procedure to call when `insert_mode` is `StoredProc` (`schema.name` or `name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_proc_name: Option<String>,

    /// Target column (or procedure parameter) → field reference or literal
    #[serde(default)]
    pub column_mapping: BTreeMap<String, String>,

    /// Optional `<field> <op> <value>` predicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_condition: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Higher priorities are written first
    #[serde(default)]
    pub priority: i32,

    /// Proceed with the next mapping when this one fails
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
}

impl TableMapping {
    /// `schema.table` label used in logs and outcomes
    pub fn target(&self) -> String {
        format!("{}.{}", self.target_schema, self.target_table)
    }

    /// The filter condition, if one is set and not blank
    pub fn filter(&self) -> Option<&str> {
        self.filter_condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// Inbound routing rule: topic pattern → table mappings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    #[serde(default)]
    pub id: i64,

    pub name: String,

    /// MQTT topic pattern (supports wildcards: +, #)
    pub topic_pattern: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Payload format: JSON, TEXT or BINARY
    #[serde(default = "default_message_format")]
    pub message_format: String,

    /// Column mapping used by table mappings that declare none of their own
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,

    #[serde(default = "default_qos")]
    pub qos: QoS,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub table_mappings: Vec<TableMapping>,
}

impl RouteConfig {
    /// Column mapping for a table mapping, falling back to the route-level mapping
    pub fn column_mapping_for<'a>(
        &'a self,
        mapping: &'a TableMapping,
    ) -> Option<&'a BTreeMap<String, String>> {
        if !mapping.column_mapping.is_empty() {
            Some(&mapping.column_mapping)
        } else if !self.field_mapping.is_empty() {
            Some(&self.field_mapping)
        } else {
            None
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.name.trim().is_empty() {
            return Err(BridgeError::config("Route name cannot be empty"));
        }
        if self.topic_pattern.trim().is_empty() {
            return Err(BridgeError::config(format!(
                "Route '{}' has an empty topic pattern",
                self.name
            )));
        }
        for mapping in &self.table_mappings {
            if mapping.target_table.trim().is_empty() {
                return Err(BridgeError::config(format!(
                    "Route '{}' has a table mapping without a target table",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Outbound source table tracked for republishing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_schema")]
    pub schema: String,

    pub table_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_primary_key")]
    pub primary_key: String,

    /// Column that groups rows (e.g. a device or monitor id), used in diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_column: Option<String>,

    #[serde(default = "default_where_clause")]
    pub where_clause: String,

    /// ORDER BY expression; defaults to the primary key ascending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Topic template with `{column}` placeholders
    pub topic_pattern: String,

    #[serde(default = "default_qos")]
    pub qos: QoS,

    #[serde(default)]
    pub retain: bool,

    /// Source column → payload field; empty passes every column through
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.name.trim().is_empty() {
            return Err(BridgeError::config("Source name cannot be empty"));
        }
        if self.table_name.trim().is_empty() {
            return Err(BridgeError::config(format!(
                "Source '{}' has no table name",
                self.name
            )));
        }
        if self.topic_pattern.trim().is_empty() {
            return Err(BridgeError::config(format!(
                "Source '{}' has an empty topic pattern",
                self.name
            )));
        }
        if self.batch_size == 0 {
            return Err(BridgeError::config(format!(
                "Source '{}' batch_size must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Append-only fact: a source row was published successfully
#[derive(Debug, Clone, PartialEq)]
pub struct SentRecord {
    pub source_name: String,
    pub record_id: String,
    pub topic: String,
    pub correlation_id: Uuid,
    pub sent_at: DateTime<Utc>,
}

/// Result of one publish with retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

impl DeliveryOutcome {
    pub fn delivered(attempts: u32) -> Self {
        Self {
            success: true,
            error: None,
            attempts,
        }
    }

    pub fn failed(attempts: u32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            attempts,
        }
    }
}
