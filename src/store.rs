//! Configuration stores for routing and publishing rules.
//!
//! Every call reads the store afresh; snapshots are owned by the workers.

use crate::error::{BridgeError, BridgeResult};
use crate::model::{QoS, RouteConfig, SourceConfig, TableMapping};
use crate::storage::{qualified_name, Storage};
use crate::value::{FieldMap, FieldValue};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Every enabled route config
    async fn load_route_configs(&self) -> BridgeResult<Vec<RouteConfig>>;

    /// Every enabled source config
    async fn load_source_configs(&self) -> BridgeResult<Vec<SourceConfig>>;

    async fn count_enabled_route_configs(&self) -> BridgeResult<usize>;

    async fn count_enabled_source_configs(&self) -> BridgeResult<usize>;
}

/// Store backed by the `receiver_config` and `source_config` tables
pub struct SqlConfigStore {
    storage: Arc<dyn Storage>,
    receiver_config: String,
    source_config: String,
}

impl SqlConfigStore {
    pub fn new(storage: Arc<dyn Storage>, schema: &str) -> BridgeResult<Self> {
        Ok(Self {
            storage,
            receiver_config: qualified_name(schema, "receiver_config")?,
            source_config: qualified_name(schema, "source_config")?,
        })
    }

    async fn count(&self, table: &str) -> BridgeResult<usize> {
        let sql = format!(
            "SELECT COUNT(*)::BIGINT AS enabled_count FROM {} WHERE enabled = TRUE",
            table
        );
        let rows = self
            .storage
            .query(&sql, &[])
            .await
            .map_err(|e| BridgeError::config(format!("Failed to count {}: {}", table, e)))?;
        let count = rows
            .first()
            .and_then(|row| row.get("enabled_count"))
            .and_then(FieldValue::as_decimal)
            .and_then(|d| d.to_usize())
            .unwrap_or(0);
        Ok(count)
    }
}

fn required_text(row: &FieldMap, column: &str) -> BridgeResult<String> {
    row.get(column)
        .filter(|v| !v.is_null())
        .map(FieldValue::as_text)
        .ok_or_else(|| BridgeError::config(format!("Column '{}' is missing or NULL", column)))
}

fn optional_text(row: &FieldMap, column: &str) -> Option<String> {
    row.get(column)
        .filter(|v| !v.is_null())
        .map(FieldValue::as_text)
        .filter(|s| !s.trim().is_empty())
}

fn integer(row: &FieldMap, column: &str) -> BridgeResult<i64> {
    row.get(column)
        .and_then(FieldValue::as_decimal)
        .and_then(|d| d.to_i64())
        .ok_or_else(|| BridgeError::config(format!("Column '{}' is not an integer", column)))
}

fn flag(row: &FieldMap, column: &str) -> bool {
    matches!(row.get(column), Some(FieldValue::Bool(true)))
}

fn json_column<T: serde::de::DeserializeOwned + Default>(
    row: &FieldMap,
    column: &str,
    owner: &str,
) -> BridgeResult<T> {
    match optional_text(row, column) {
        Some(json) => serde_json::from_str(&json).map_err(|e| {
            BridgeError::config(format!("Invalid {} for '{}': {}", column, owner, e))
        }),
        None => Ok(T::default()),
    }
}

fn route_from_row(row: &FieldMap) -> BridgeResult<RouteConfig> {
    let name = required_text(row, "config_name")?;
    let field_mapping: BTreeMap<String, String> = json_column(row, "field_mapping_json", &name)?;
    let table_mappings: Vec<TableMapping> = json_column(row, "table_mappings_json", &name)?;

    Ok(RouteConfig {
        id: integer(row, "id")?,
        topic_pattern: required_text(row, "topic_pattern")?,
        description: optional_text(row, "description"),
        message_format: optional_text(row, "message_format").unwrap_or_else(|| "JSON".to_string()),
        field_mapping,
        qos: QoS::from_level(integer(row, "qos_level")?)?,
        enabled: flag(row, "enabled"),
        table_mappings,
        name,
    })
}

fn source_from_row(row: &FieldMap) -> BridgeResult<SourceConfig> {
    let name = required_text(row, "source_name")?;
    let field_mapping: BTreeMap<String, String> = json_column(row, "field_mapping_json", &name)?;

    let batch_size = u32::try_from(integer(row, "batch_size")?)
        .map_err(|_| BridgeError::config(format!("Invalid batch_size for '{}'", name)))?;
    let poll_interval_secs = u64::try_from(integer(row, "polling_interval_seconds")?)
        .map_err(|_| BridgeError::config(format!("Invalid polling interval for '{}'", name)))?;

    Ok(SourceConfig {
        enabled: flag(row, "enabled"),
        schema: optional_text(row, "schema_name").unwrap_or_else(|| "public".to_string()),
        table_name: required_text(row, "table_name")?,
        description: optional_text(row, "description"),
        primary_key: optional_text(row, "primary_key_column").unwrap_or_else(|| "id".to_string()),
        group_column: optional_text(row, "group_column"),
        where_clause: optional_text(row, "where_clause").unwrap_or_else(|| "1=1".to_string()),
        order_by: optional_text(row, "order_by_clause"),
        batch_size,
        poll_interval_secs,
        topic_pattern: required_text(row, "topic_pattern")?,
        qos: QoS::from_level(integer(row, "qos_level")?)?,
        retain: flag(row, "retain_flag"),
        field_mapping,
        name,
    })
}

#[async_trait]
impl ConfigStore for SqlConfigStore {
    async fn load_route_configs(&self) -> BridgeResult<Vec<RouteConfig>> {
        let sql = format!(
            "SELECT * FROM {} WHERE enabled = TRUE ORDER BY id",
            self.receiver_config
        );
        let rows = self.storage.query(&sql, &[]).await.map_err(|e| {
            BridgeError::config(format!("Failed to load receiver configuration: {}", e))
        })?;

        let routes = rows
            .iter()
            .map(route_from_row)
            .collect::<BridgeResult<Vec<_>>>()?;
        info!("Loaded {} receiver configuration(s)", routes.len());
        for route in &routes {
            info!(
                "  - {}: Topic='{}', Mappings={}",
                route.name,
                route.topic_pattern,
                route.table_mappings.len()
            );
        }
        Ok(routes)
    }

    async fn load_source_configs(&self) -> BridgeResult<Vec<SourceConfig>> {
        let sql = format!(
            "SELECT * FROM {} WHERE enabled = TRUE ORDER BY source_name",
            self.source_config
        );
        let rows = self.storage.query(&sql, &[]).await.map_err(|e| {
            BridgeError::config(format!("Failed to load source configuration: {}", e))
        })?;

        let sources = rows
            .iter()
            .map(source_from_row)
            .collect::<BridgeResult<Vec<_>>>()?;
        info!("Configuration loaded from database - {} sources found", sources.len());
        Ok(sources)
    }

    async fn count_enabled_route_configs(&self) -> BridgeResult<usize> {
        self.count(&self.receiver_config).await
    }

    async fn count_enabled_source_configs(&self) -> BridgeResult<usize> {
        self.count(&self.source_config).await
    }
}

#[derive(Debug, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    routes: Vec<RouteConfig>,
    #[serde(default)]
    sources: Vec<SourceConfig>,
}

/// Store backed by a TOML rules file with `[[routes]]` and `[[sources]]` tables
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> BridgeResult<RulesFile> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            BridgeError::config(format!(
                "Failed to read rules file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let rules: RulesFile = toml::from_str(&content).map_err(|e| {
            BridgeError::config(format!(
                "Failed to parse rules file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        debug!(
            "Read {} routes and {} sources from {}",
            rules.routes.len(),
            rules.sources.len(),
            self.path.display()
        );
        Ok(rules)
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load_route_configs(&self) -> BridgeResult<Vec<RouteConfig>> {
        Ok(self
            .read()
            .await?
            .routes
            .into_iter()
            .filter(|r| r.enabled)
            .collect())
    }

    async fn load_source_configs(&self) -> BridgeResult<Vec<SourceConfig>> {
        Ok(self
            .read()
            .await?
            .sources
            .into_iter()
            .filter(|s| s.enabled)
            .collect())
    }

    async fn count_enabled_route_configs(&self) -> BridgeResult<usize> {
        Ok(self.read().await?.routes.iter().filter(|r| r.enabled).count())
    }

    async fn count_enabled_source_configs(&self) -> BridgeResult<usize> {
        Ok(self.read().await?.sources.iter().filter(|s| s.enabled).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InsertMode, DEFAULT_BATCH_SIZE};
    use crate::storage::MockStorage;

    const RULES: &str = r#"
        [[routes]]
        name = "temp-alerts"
        topic_pattern = "sensor/+/temperature"

        [[routes.table_mappings]]
        target_schema = "dbo"
        target_table = "TableA"
        filter_condition = "Value > 75.0"
        column_mapping = { MonitorId = "MonitorId", Reading = "Value" }

        [[routes]]
        name = "disabled"
        topic_pattern = "other/#"
        enabled = false

        [[sources]]
        name = "table-a"
        table_name = "table_a"
        topic_pattern = "data/table_a/{monitor_id}"
        group_column = "monitor_id"
        qos = "AtMostOnce"
    "#;

    fn rules_file(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}.toml", name, std::process::id()));
        std::fs::write(&path, RULES).unwrap();
        path
    }

    #[tokio::test]
    async fn test_file_store_loads_enabled_configs() {
        let path = rules_file("bridge-rules-load");
        let store = FileConfigStore::new(&path);

        let routes = store.load_route_configs().await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].table_mappings[0].target(), "dbo.TableA");
        assert_eq!(routes[0].table_mappings[0].column_mapping.len(), 2);
        assert_eq!(store.count_enabled_route_configs().await.unwrap(), 1);

        let sources = store.load_source_configs().await.unwrap();
        assert_eq!(sources[0].qos, QoS::AtMostOnce);
        assert_eq!(sources[0].batch_size, 1000);
        assert_eq!(store.count_enabled_source_configs().await.unwrap(), 1);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_sample_rules_file_parses() {
        let rules: RulesFile = toml::from_str(include_str!("../config/rules.toml")).unwrap();
        assert_eq!(rules.routes[0].table_mappings.len(), 3);
        assert_eq!(
            rules.routes[0].table_mappings[2].insert_mode,
            InsertMode::StoredProc
        );
        assert_eq!(rules.sources[0].field_mapping.len(), 3);
    }

    #[test]
    fn test_schema_batch_size_default_matches_file_default() {
        let schema = include_str!("../sql/schema.sql");
        let column = schema
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with("batch_size "))
            .unwrap();
        assert!(column.contains(&format!("DEFAULT {} ", DEFAULT_BATCH_SIZE)));

        let rules: RulesFile = toml::from_str(RULES).unwrap();
        assert_eq!(rules.sources[0].batch_size, DEFAULT_BATCH_SIZE);
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_config_error() {
        let store = FileConfigStore::new("/nonexistent/bridge-rules.toml");
        let err = store.count_enabled_route_configs().await.unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn test_sql_store_parses_receiver_rows() {
        let mut storage = MockStorage::new();
        storage
            .expect_query()
            .withf(|sql, _| sql.starts_with("SELECT * FROM mqtt.receiver_config"))
            .returning(|_, _| {
                let mut row = FieldMap::new();
                row.insert("id", 7i64);
                row.insert("config_name", "temp-alerts");
                row.insert("topic_pattern", "sensor/+/temperature");
                row.insert("description", FieldValue::Null);
                row.insert("message_format", "JSON");
                row.insert("qos_level", 1i64);
                row.insert("enabled", true);
                row.insert("field_mapping_json", FieldValue::Null);
                row.insert(
                    "table_mappings_json",
                    r#"[{"target_table": "Audit", "insert_mode": "StoredProcedure",
                         "stored_proc_name": "audit.log_reading"}]"#,
                );
                Ok(vec![row])
            });
        let store = SqlConfigStore::new(Arc::new(storage), "mqtt").unwrap();

        let routes = store.load_route_configs().await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].id, 7);
        assert_eq!(routes[0].qos, QoS::AtLeastOnce);
        assert_eq!(routes[0].table_mappings[0].insert_mode, InsertMode::StoredProc);
        assert!(routes[0].field_mapping.is_empty());
    }

    #[tokio::test]
    async fn test_sql_store_counts() {
        let mut storage = MockStorage::new();
        storage
            .expect_query()
            .withf(|sql, _| sql.contains("FROM mqtt.source_config WHERE enabled = TRUE"))
            .returning(|_, _| {
                let mut row = FieldMap::new();
                row.insert("enabled_count", 4i64);
                Ok(vec![row])
            });
        let store = SqlConfigStore::new(Arc::new(storage), "mqtt").unwrap();

        assert_eq!(store.count_enabled_source_configs().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_sql_store_rejects_bad_qos() {
        let mut storage = MockStorage::new();
        storage.expect_query().returning(|_, _| {
            let mut row = FieldMap::new();
            row.insert("source_name", "table-a");
            row.insert("table_name", "table_a");
            row.insert("topic_pattern", "data/{id}");
            row.insert("batch_size", 10i64);
            row.insert("polling_interval_seconds", 5i64);
            row.insert("qos_level", 7i64);
            row.insert("enabled", true);
            Ok(vec![row])
        });
        let store = SqlConfigStore::new(Arc::new(storage), "mqtt").unwrap();

        assert!(store.load_source_configs().await.is_err());
    }
}
