//! Audit trail of routed messages and published rows.
//!
//! Auditing never affects processing: sinks swallow their own failures and
//! report them as diagnostics.

use crate::error::BridgeResult;
use crate::storage::{qualified_name, Storage};
use crate::value::FieldValue;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// One routed message, per matched route config
#[derive(Debug, Clone, PartialEq)]
pub struct MessageAudit {
    pub topic: String,
    pub config_name: String,
    pub success: bool,
    pub tables_affected: u32,
    pub error_message: Option<String>,
}

/// One outbound row publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishAudit {
    pub source_name: String,
    pub topic: String,
    pub success: bool,
    pub error_message: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn message(&self, event: &MessageAudit);

    async fn publish(&self, event: &PublishAudit);
}

/// Writes audit events as structured log lines
#[derive(Debug, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn message(&self, event: &MessageAudit) {
        if event.success {
            info!(
                topic = %event.topic,
                config = %event.config_name,
                tables = event.tables_affected,
                "Message routed"
            );
        } else {
            warn!(
                topic = %event.topic,
                config = %event.config_name,
                tables = event.tables_affected,
                error = event.error_message.as_deref().unwrap_or(""),
                "Message routing failed"
            );
        }
    }

    async fn publish(&self, event: &PublishAudit) {
        if event.success {
            info!(source = %event.source_name, topic = %event.topic, "Row published");
        } else {
            warn!(
                source = %event.source_name,
                topic = %event.topic,
                error = event.error_message.as_deref().unwrap_or(""),
                "Row publish failed"
            );
        }
    }
}

/// Persists audit events into `received_messages` and `published_messages`
pub struct StorageAuditSink {
    storage: Arc<dyn Storage>,
    received_sql: String,
    published_sql: String,
}

impl StorageAuditSink {
    pub fn new(storage: Arc<dyn Storage>, schema: &str) -> BridgeResult<Self> {
        let received = qualified_name(schema, "received_messages")?;
        let published = qualified_name(schema, "published_messages")?;
        Ok(Self {
            storage,
            received_sql: format!(
                "INSERT INTO {} (topic, config_name, success, tables_affected, error_message, received_at) \
                 VALUES ($1, $2, $3, $4, $5, now())",
                received
            ),
            published_sql: format!(
                "INSERT INTO {} (source_name, topic, success, error_message, published_at) \
                 VALUES ($1, $2, $3, $4, now())",
                published
            ),
        })
    }
}

fn optional_text(value: &Option<String>) -> FieldValue {
    value
        .as_ref()
        .map(|s| FieldValue::String(s.clone()))
        .unwrap_or(FieldValue::Null)
}

#[async_trait]
impl AuditSink for StorageAuditSink {
    async fn message(&self, event: &MessageAudit) {
        let params = [
            FieldValue::from(event.topic.as_str()),
            FieldValue::from(event.config_name.as_str()),
            FieldValue::from(event.success),
            FieldValue::from(i64::from(event.tables_affected)),
            optional_text(&event.error_message),
        ];
        if let Err(e) = self.storage.execute(&self.received_sql, &params).await {
            warn!("Failed to store message audit for {}: {}", event.topic, e);
        }
    }

    async fn publish(&self, event: &PublishAudit) {
        let params = [
            FieldValue::from(event.source_name.as_str()),
            FieldValue::from(event.topic.as_str()),
            FieldValue::from(event.success),
            optional_text(&event.error_message),
        ];
        if let Err(e) = self.storage.execute(&self.published_sql, &params).await {
            warn!("Failed to store publish audit for {}: {}", event.topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingStorage;

    #[tokio::test]
    async fn test_storage_sink_writes_rows() {
        let storage = Arc::new(RecordingStorage::default());
        let sink = StorageAuditSink::new(storage.clone(), "mqtt").unwrap();

        sink.message(&MessageAudit {
            topic: "sensor/3/temperature".to_string(),
            config_name: "temp-alerts".to_string(),
            success: true,
            tables_affected: 2,
            error_message: None,
        })
        .await;

        let statements = storage.statements();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].sql.starts_with("INSERT INTO mqtt.received_messages"));
        assert_eq!(statements[0].params[3], FieldValue::from(2i64));
        assert_eq!(statements[0].params[4], FieldValue::Null);
    }

    #[tokio::test]
    async fn test_storage_sink_swallows_failures() {
        let storage = Arc::new(RecordingStorage::default());
        storage.fail_when("published_messages");
        let sink = StorageAuditSink::new(storage.clone(), "mqtt").unwrap();

        sink.publish(&PublishAudit {
            source_name: "table-a".to_string(),
            topic: "data/table_a/3".to_string(),
            success: false,
            error_message: Some("broker unavailable".to_string()),
        })
        .await;

        assert_eq!(storage.statements().len(), 1);
    }

    #[test]
    fn test_storage_sink_rejects_bad_schema() {
        let storage = Arc::new(RecordingStorage::default());
        assert!(StorageAuditSink::new(storage, "mqtt audit").is_err());
    }
}
