//! Write strategies for table mappings.
//!
//! `Direct` issues a parameterized INSERT over the columns that resolved.
//! `StoredProcedure` binds every declared input parameter of the procedure,
//! by name, and calls it. Parameter lists are looked up once per procedure
//! and cached until the routing configuration is reloaded.

use crate::error::{BridgeError, BridgeResult};
use crate::mapper;
use crate::model::{InsertMode, TableMapping};
use crate::storage::{identifier, qualified_name, Storage};
use crate::value::{FieldMap, FieldValue};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// How one table mapping is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertStrategy {
    Direct,
    StoredProcedure { procedure: String },
}

impl InsertStrategy {
    pub fn for_mapping(mapping: &TableMapping) -> BridgeResult<Self> {
        match mapping.insert_mode {
            InsertMode::Direct => Ok(InsertStrategy::Direct),
            InsertMode::StoredProc => mapping
                .stored_proc_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| InsertStrategy::StoredProcedure {
                    procedure: name.to_string(),
                })
                .ok_or_else(|| {
                    BridgeError::config(format!(
                        "Table mapping {} uses StoredProc without a procedure name",
                        mapping.target()
                    ))
                }),
        }
    }
}

/// Executes table mapping writes against a [`Storage`]
pub struct Inserter {
    storage: Arc<dyn Storage>,
    procedures: RwLock<HashMap<String, Arc<Vec<String>>>>,
}

impl Inserter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            procedures: RwLock::new(HashMap::new()),
        }
    }

    /// Write one mapping for a decoded message, returning the affected row count
    pub async fn write(
        &self,
        mapping: &TableMapping,
        column_mapping: &BTreeMap<String, String>,
        fields: &FieldMap,
    ) -> BridgeResult<u64> {
        match InsertStrategy::for_mapping(mapping)? {
            InsertStrategy::Direct => self.insert_direct(mapping, column_mapping, fields).await,
            InsertStrategy::StoredProcedure { procedure } => {
                self.call_procedure(&procedure, column_mapping, fields)
                    .await
            }
        }
    }

    async fn insert_direct(
        &self,
        mapping: &TableMapping,
        column_mapping: &BTreeMap<String, String>,
        fields: &FieldMap,
    ) -> BridgeResult<u64> {
        let table = qualified_name(&mapping.target_schema, &mapping.target_table)?;
        let resolved = mapper::resolve_columns(column_mapping, fields);
        if resolved.is_empty() {
            return Err(BridgeError::mapping(format!(
                "No columns to insert for {}",
                table
            )));
        }

        let mut columns = Vec::with_capacity(resolved.len());
        let mut params = Vec::with_capacity(resolved.len());
        for (column, value) in resolved {
            columns.push(identifier(&column)?.to_string());
            params.push(value);
        }
        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );

        debug!("Inserting {} columns into {}", columns.len(), table);
        self.storage
            .execute(&sql, &params)
            .await
            .map_err(|e| BridgeError::write(format!("Insert into {} failed: {}", table, e)))
    }

    async fn call_procedure(
        &self,
        procedure: &str,
        column_mapping: &BTreeMap<String, String>,
        fields: &FieldMap,
    ) -> BridgeResult<u64> {
        let parameters = self.procedure_parameters(procedure).await?;

        let params: Vec<FieldValue> = parameters
            .iter()
            .map(|parameter| {
                let wanted = parameter.trim_start_matches('@');
                column_mapping
                    .iter()
                    .find(|(key, _)| key.trim_start_matches('@').eq_ignore_ascii_case(wanted))
                    .and_then(|(_, spec)| mapper::resolve(spec, fields))
                    .unwrap_or(FieldValue::Null)
            })
            .collect();

        debug!(
            "Calling {} with {} parameters",
            procedure,
            params.len()
        );
        self.storage
            .call(procedure, &params)
            .await
            .map_err(|e| BridgeError::write(format!("Call to {} failed: {}", procedure, e)))
    }

    async fn procedure_parameters(&self, procedure: &str) -> BridgeResult<Arc<Vec<String>>> {
        let key = procedure.trim().to_ascii_lowercase();
        if let Some(cached) = self.procedures.read().await.get(&key) {
            return Ok(Arc::clone(cached));
        }

        let parameters = Arc::new(self.storage.introspect(procedure).await?);
        debug!(
            "Procedure {} declares parameters {:?}",
            procedure, parameters
        );
        self.procedures
            .write()
            .await
            .insert(key, Arc::clone(&parameters));
        Ok(parameters)
    }

    /// Forget cached procedure parameter lists
    pub async fn clear_cache(&self) {
        self.procedures.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockStorage;
    use crate::testing::RecordingStorage;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn mapping(mode: InsertMode, proc_name: Option<&str>) -> TableMapping {
        TableMapping {
            target_schema: "dbo".to_string(),
            target_table: "TableA".to_string(),
            insert_mode: mode,
            stored_proc_name: proc_name.map(str::to_string),
            column_mapping: BTreeMap::new(),
            filter_condition: None,
            enabled: true,
            priority: 0,
            continue_on_error: true,
        }
    }

    fn columns(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn message() -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("MonitorId", 3i64);
        fields.insert("Value", Decimal::from_str("82.5").unwrap());
        fields
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(
            InsertStrategy::for_mapping(&mapping(InsertMode::Direct, None)).unwrap(),
            InsertStrategy::Direct
        );
        assert_eq!(
            InsertStrategy::for_mapping(&mapping(InsertMode::StoredProc, Some(" audit.log "))).unwrap(),
            InsertStrategy::StoredProcedure {
                procedure: "audit.log".to_string()
            }
        );

        let err = InsertStrategy::for_mapping(&mapping(InsertMode::StoredProc, None)).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn test_direct_insert_uses_resolved_columns_only() {
        let storage = Arc::new(RecordingStorage::default());
        let inserter = Inserter::new(storage.clone());

        let affected = inserter
            .write(
                &mapping(InsertMode::Direct, None),
                &columns(&[
                    ("MonitorId", "MonitorId"),
                    ("Reading", "$.Value"),
                    ("Note", "NotInMessage"),
                ]),
                &message(),
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let statements = storage.statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].sql,
            "INSERT INTO dbo.TableA (MonitorId, Reading) VALUES ($1, $2)"
        );
        assert_eq!(
            statements[0].params,
            vec![
                FieldValue::from(3i64),
                FieldValue::from(Decimal::from_str("82.5").unwrap())
            ]
        );
    }

    #[tokio::test]
    async fn test_direct_insert_without_columns_is_mapping_error() {
        let mut storage = MockStorage::new();
        storage.expect_execute().never();
        let inserter = Inserter::new(Arc::new(storage));

        let err = inserter
            .write(
                &mapping(InsertMode::Direct, None),
                &columns(&[("Note", "NotInMessage")]),
                &message(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "mapping");
    }

    #[tokio::test]
    async fn test_invalid_identifier_rejected_before_sql() {
        let mut storage = MockStorage::new();
        storage.expect_execute().never();
        let inserter = Inserter::new(Arc::new(storage));

        let err = inserter
            .write(
                &mapping(InsertMode::Direct, None),
                &columns(&[("Reading); DROP TABLE x; --", "Value")]),
                &message(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "mapping");
    }

    #[tokio::test]
    async fn test_storage_failure_is_write_error() {
        let mut storage = MockStorage::new();
        storage
            .expect_execute()
            .times(1)
            .returning(|_, _| Err(BridgeError::storage("duplicate key")));
        let inserter = Inserter::new(Arc::new(storage));

        let err = inserter
            .write(
                &mapping(InsertMode::Direct, None),
                &columns(&[("Reading", "Value")]),
                &message(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "write");
        assert!(err.to_string().contains("duplicate key"));
    }

    #[tokio::test]
    async fn test_stored_procedure_binds_declared_parameters_in_order() {
        let storage = Arc::new(RecordingStorage::default());
        storage.declare_procedure("audit.log_reading", &["monitor_id", "reading", "note"]);
        let inserter = Inserter::new(storage.clone());

        inserter
            .write(
                &mapping(InsertMode::StoredProc, Some("audit.log_reading")),
                &columns(&[
                    ("Reading", "Value"),
                    ("MONITOR_ID", "MonitorId"),
                    ("ignored", "\"not a parameter\""),
                ]),
                &message(),
            )
            .await
            .unwrap();

        let statements = storage.statements();
        assert_eq!(statements[0].sql, "CALL audit.log_reading");
        assert_eq!(
            statements[0].params,
            vec![
                FieldValue::from(3i64),
                FieldValue::from(Decimal::from_str("82.5").unwrap()),
                FieldValue::Null
            ]
        );
    }

    #[tokio::test]
    async fn test_procedure_parameters_cached_until_cleared() {
        let storage = Arc::new(RecordingStorage::default());
        storage.declare_procedure("audit.log_reading", &["reading"]);
        let inserter = Inserter::new(storage.clone());
        let target = mapping(InsertMode::StoredProc, Some("audit.log_reading"));
        let mapped = columns(&[("reading", "Value")]);

        inserter.write(&target, &mapped, &message()).await.unwrap();
        inserter.write(&target, &mapped, &message()).await.unwrap();
        assert_eq!(storage.introspections(), 1);

        inserter.clear_cache().await;
        inserter.write(&target, &mapped, &message()).await.unwrap();
        assert_eq!(storage.introspections(), 2);
    }
}
