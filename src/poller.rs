//! One poll cycle of an outbound source.

use crate::audit::{AuditSink, PublishAudit};
use crate::broker::OutboundMessage;
use crate::codec;
use crate::error::BridgeResult;
use crate::mapper;
use crate::model::{SentRecord, SourceConfig};
use crate::retry::RetryPublisher;
use crate::tracker::{DeliveryTracker, RECORD_ID_COLUMN};
use crate::value::FieldMap;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Counters of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub selected: usize,
    pub published: usize,
    pub failed: usize,
}

/// Substitute `{column}` placeholders with row values; unresolved ones become `unknown`
pub fn render_topic(template: &str, row: &FieldMap) -> String {
    let mut topic = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|c| open + c) else {
            break;
        };
        topic.push_str(&rest[..open]);
        let column = rest[open + 1..close].trim();
        match row.get(column).filter(|v| !v.is_null()) {
            Some(value) => topic.push_str(&value.as_text()),
            None => topic.push_str("unknown"),
        }
        rest = &rest[close + 1..];
    }
    topic.push_str(rest);
    topic
}

pub struct OutboundPoller {
    tracker: Arc<dyn DeliveryTracker>,
    publisher: RetryPublisher,
    audit: Arc<dyn AuditSink>,
    max_retry_attempts: u32,
}

impl OutboundPoller {
    pub fn new(
        tracker: Arc<dyn DeliveryTracker>,
        publisher: RetryPublisher,
        audit: Arc<dyn AuditSink>,
        max_retry_attempts: u32,
    ) -> Self {
        Self {
            tracker,
            publisher,
            audit,
            max_retry_attempts,
        }
    }

    /// Publish the unsent rows of one source.
    ///
    /// Only the selection query can fail the tick; per-row problems are
    /// counted in the summary.
    pub async fn tick(
        &self,
        source: &SourceConfig,
        cancel: &CancellationToken,
    ) -> BridgeResult<TickSummary> {
        let rows = self.tracker.fetch_unsent(source).await?;
        let mut summary = TickSummary {
            selected: rows.len(),
            ..TickSummary::default()
        };
        if rows.is_empty() {
            return Ok(summary);
        }
        debug!(source = %source.name, rows = rows.len(), "Publishing unsent rows");

        for row in &rows {
            if cancel.is_cancelled() {
                info!(source = %source.name, "Cancelled, leaving remaining rows for the next run");
                break;
            }

            if self.publish_row(source, row, cancel).await {
                summary.published += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            source = %source.name,
            selected = summary.selected,
            published = summary.published,
            failed = summary.failed,
            "Poll cycle finished"
        );
        Ok(summary)
    }

    async fn publish_row(
        &self,
        source: &SourceConfig,
        row: &FieldMap,
        cancel: &CancellationToken,
    ) -> bool {
        let mut columns = row.clone();
        let cast_id = columns.remove(RECORD_ID_COLUMN).filter(|v| !v.is_null());
        let topic = render_topic(&source.topic_pattern, &columns);

        let Some(record_id) = cast_id
            .or_else(|| columns.get(&source.primary_key).filter(|v| !v.is_null()).cloned())
            .map(|v| v.as_text())
        else {
            warn!(
                source = %source.name,
                "Row has no value for primary key column '{}', skipping",
                source.primary_key
            );
            self.audit_publish(source, &topic, Some("Missing primary key value".to_string()))
                .await;
            return false;
        };

        let correlation_id = Uuid::new_v4();
        let mut payload = mapper::rename(&source.field_mapping, &columns);
        payload.insert("SourceTable", source.table_name.as_str());
        payload.insert("ProcessedAt", Utc::now().to_rfc3339());
        payload.insert("CorrelationId", correlation_id.to_string());

        let group = source
            .group_column
            .as_deref()
            .and_then(|column| columns.get(column))
            .map(|v| v.as_text())
            .unwrap_or_default();

        let error = match codec::encode(&payload) {
            Ok(bytes) => {
                let message = OutboundMessage {
                    topic: topic.clone(),
                    payload: bytes,
                    qos: source.qos,
                    retain: source.retain,
                    correlation_id,
                };
                let outcome = self.publisher.publish(&message, cancel).await;
                if outcome.success {
                    self.mark_sent(source, &record_id, &topic, correlation_id)
                        .await;
                    debug!(
                        source = %source.name,
                        record_id = %record_id,
                        group = %group,
                        attempts = outcome.attempts,
                        "Published to {}",
                        topic
                    );
                    None
                } else {
                    let error = outcome.error.unwrap_or_else(|| "Publish failed".to_string());
                    if !cancel.is_cancelled() {
                        self.count_failure(source, &record_id, &error).await;
                    }
                    Some(error)
                }
            }
            Err(e) => {
                let error = e.to_string();
                self.count_failure(source, &record_id, &error).await;
                Some(error)
            }
        };

        let success = error.is_none();
        self.audit_publish(source, &topic, error).await;
        success
    }

    async fn mark_sent(
        &self,
        source: &SourceConfig,
        record_id: &str,
        topic: &str,
        correlation_id: Uuid,
    ) {
        let record = SentRecord {
            source_name: source.name.clone(),
            record_id: record_id.to_string(),
            topic: topic.to_string(),
            correlation_id,
            sent_at: Utc::now(),
        };
        match self.tracker.mark_sent(&record).await {
            Ok(true) => {}
            Ok(false) => warn!(
                source = %source.name,
                record_id = %record_id,
                "Record was already marked sent by another publisher"
            ),
            Err(e) => error!(
                source = %source.name,
                record_id = %record_id,
                "Published but failed to record delivery, row will be republished: {}",
                e
            ),
        }
    }

    async fn count_failure(&self, source: &SourceConfig, record_id: &str, error: &str) {
        match self
            .tracker
            .record_failure(&source.name, record_id, error, self.max_retry_attempts)
            .await
        {
            Ok(state) if state.terminal => error!(
                source = %source.name,
                record_id = %record_id,
                "Row failed permanently after {} attempts",
                state.retry_count
            ),
            Ok(state) => warn!(
                source = %source.name,
                record_id = %record_id,
                "Row will be retried ({}/{})",
                state.retry_count,
                self.max_retry_attempts
            ),
            Err(e) => error!(
                source = %source.name,
                record_id = %record_id,
                "Failed to record delivery failure: {}",
                e
            ),
        }
    }

    async fn audit_publish(&self, source: &SourceConfig, topic: &str, error: Option<String>) {
        self.audit
            .publish(&PublishAudit {
                source_name: source.name.clone(),
                topic: topic.to_string(),
                success: error.is_none(),
                error_message: error,
            })
            .await;
    }
}
