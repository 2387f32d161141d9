//! Delivery tracking for outbound sources.
//!
//! A row is unsent while no `sent_records` row exists for its
//! (source, record id) and it has not been marked terminally failed in
//! `delivery_failures`. `sent_records` is append-only: this module inserts
//! into it and never updates or deletes.
//!
//! Record ids are always the server's text cast of the primary key. The
//! selection query returns that cast in [`RECORD_ID_COLUMN`] so the id written
//! to `sent_records` is byte-for-byte the one the anti-join compares against,
//! whatever the key's type.

use crate::error::{BridgeError, BridgeResult};
use crate::model::{SentRecord, SourceConfig};
use crate::storage::{identifier, qualified_name, Storage};
use crate::value::{FieldMap, FieldValue};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::debug;

/// Extra column carrying `CAST(<primary key> AS TEXT)` in selected rows
pub const RECORD_ID_COLUMN: &str = "bridge_record_id";

/// Retry counter of a row after a failed publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureState {
    pub retry_count: u32,
    /// The row is excluded from polling from now on
    pub terminal: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryTracker: Send + Sync {
    /// Up to `batch_size` rows of the source that still need publishing
    async fn fetch_unsent(&self, source: &SourceConfig) -> BridgeResult<Vec<FieldMap>>;

    /// Record a successful publish. Returns `false` when the record already existed.
    async fn mark_sent(&self, record: &SentRecord) -> BridgeResult<bool>;

    /// Count a failed publish against the row
    async fn record_failure(
        &self,
        source_name: &str,
        record_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> BridgeResult<FailureState>;
}

/// Tracker backed by the `sent_records` and `delivery_failures` tables
pub struct SqlDeliveryTracker {
    storage: Arc<dyn Storage>,
    sent_records: String,
    delivery_failures: String,
}

impl SqlDeliveryTracker {
    pub fn new(storage: Arc<dyn Storage>, schema: &str) -> BridgeResult<Self> {
        Ok(Self {
            storage,
            sent_records: qualified_name(schema, "sent_records")?,
            delivery_failures: qualified_name(schema, "delivery_failures")?,
        })
    }

    /// Anti-join over the tracking tables for one source
    pub fn unsent_query(&self, source: &SourceConfig) -> BridgeResult<String> {
        let table = qualified_name(&source.schema, &source.table_name)?;
        let pk = identifier(&source.primary_key)?;
        let where_clause = match source.where_clause.trim() {
            "" => "1=1",
            clause => clause,
        };
        let order_by = source
            .order_by
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("t.{} ASC", pk));

        Ok(format!(
            "SELECT t.*, CAST(t.{pk} AS TEXT) AS {record_id} FROM {table} AS t \
             WHERE NOT EXISTS (SELECT 1 FROM {sent} m \
                 WHERE m.source_name = $1 AND m.record_id = CAST(t.{pk} AS TEXT)) \
             AND NOT EXISTS (SELECT 1 FROM {failures} f \
                 WHERE f.source_name = $1 AND f.record_id = CAST(t.{pk} AS TEXT) AND f.status = 'Failed') \
             AND ({where_clause}) \
             ORDER BY {order_by} \
             LIMIT {limit}",
            table = table,
            sent = self.sent_records,
            failures = self.delivery_failures,
            pk = pk,
            record_id = RECORD_ID_COLUMN,
            where_clause = where_clause,
            order_by = order_by,
            limit = source.batch_size,
        ))
    }
}

#[async_trait]
impl DeliveryTracker for SqlDeliveryTracker {
    async fn fetch_unsent(&self, source: &SourceConfig) -> BridgeResult<Vec<FieldMap>> {
        let sql = self.unsent_query(source)?;
        let rows = self
            .storage
            .query(&sql, &[FieldValue::from(source.name.as_str())])
            .await?;
        debug!("Source {} has {} unsent rows", source.name, rows.len());
        Ok(rows)
    }

    async fn mark_sent(&self, record: &SentRecord) -> BridgeResult<bool> {
        let sql = format!(
            "INSERT INTO {} (source_name, record_id, topic, correlation_id, sent_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (source_name, record_id) DO NOTHING",
            self.sent_records
        );
        let params = [
            FieldValue::from(record.source_name.as_str()),
            FieldValue::from(record.record_id.as_str()),
            FieldValue::from(record.topic.as_str()),
            FieldValue::from(record.correlation_id.to_string()),
            FieldValue::from(record.sent_at.to_rfc3339()),
        ];
        let inserted = self.storage.execute(&sql, &params).await?;
        Ok(inserted > 0)
    }

    async fn record_failure(
        &self,
        source_name: &str,
        record_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> BridgeResult<FailureState> {
        let sql = format!(
            "INSERT INTO {table} AS f (source_name, record_id, retry_count, status, last_error, updated_at) \
             VALUES ($1, $2, 1, CASE WHEN 1 >= $3::int THEN 'Failed' ELSE 'Pending' END, $4, now()) \
             ON CONFLICT (source_name, record_id) DO UPDATE SET \
                 retry_count = f.retry_count + 1, \
                 status = CASE WHEN f.retry_count + 1 >= $3::int THEN 'Failed' ELSE 'Pending' END, \
                 last_error = EXCLUDED.last_error, \
                 updated_at = now() \
             RETURNING retry_count, status",
            table = self.delivery_failures
        );
        let params = [
            FieldValue::from(source_name),
            FieldValue::from(record_id),
            FieldValue::from(i64::from(max_attempts)),
            FieldValue::from(error),
        ];

        let rows = self.storage.query(&sql, &params).await?;
        let row = rows.first().ok_or_else(|| {
            BridgeError::storage(format!(
                "Failure upsert for {}/{} returned no row",
                source_name, record_id
            ))
        })?;

        let retry_count = row
            .get("retry_count")
            .and_then(FieldValue::as_decimal)
            .and_then(|d| d.to_u32())
            .unwrap_or(max_attempts);
        let terminal = row
            .get("status")
            .map(|s| s.as_text().eq_ignore_ascii_case("Failed"))
            .unwrap_or(retry_count >= max_attempts);

        Ok(FailureState {
            retry_count,
            terminal,
        })
    }
}
