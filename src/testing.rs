//! In-memory collaborators shared by unit tests.

use crate::audit::{AuditSink, MessageAudit, PublishAudit};
use crate::broker::{BrokerClient, OutboundMessage};
use crate::error::{BridgeError, BridgeResult};
use crate::model::QoS;
use crate::storage::Storage;
use crate::value::{FieldMap, FieldValue};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<FieldValue>,
}

/// Storage that records every statement and fails those matching a pattern
#[derive(Default)]
pub struct RecordingStorage {
    statements: Mutex<Vec<Statement>>,
    failing: Mutex<Vec<String>>,
    procedures: Mutex<HashMap<String, Vec<String>>>,
    introspections: AtomicUsize,
}

impl RecordingStorage {
    pub fn fail_when(&self, pattern: &str) {
        self.failing.lock().unwrap().push(pattern.to_string());
    }

    pub fn declare_procedure(&self, name: &str, parameters: &[&str]) {
        self.procedures.lock().unwrap().insert(
            name.to_string(),
            parameters.iter().map(|p| p.to_string()).collect(),
        );
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.statements.lock().unwrap().clone()
    }

    pub fn introspections(&self) -> usize {
        self.introspections.load(Ordering::SeqCst)
    }

    fn record(&self, sql: String, params: &[FieldValue]) -> BridgeResult<u64> {
        let failing = self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|pattern| sql.contains(pattern.as_str()));
        self.statements.lock().unwrap().push(Statement {
            sql: sql.clone(),
            params: params.to_vec(),
        });
        if failing {
            Err(BridgeError::storage(format!("rejected: {}", sql)))
        } else {
            Ok(1)
        }
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn query(&self, _sql: &str, _params: &[FieldValue]) -> BridgeResult<Vec<FieldMap>> {
        Ok(Vec::new())
    }

    async fn execute(&self, sql: &str, params: &[FieldValue]) -> BridgeResult<u64> {
        self.record(sql.to_string(), params)
    }

    async fn introspect(&self, procedure: &str) -> BridgeResult<Vec<String>> {
        self.introspections.fetch_add(1, Ordering::SeqCst);
        self.procedures
            .lock()
            .unwrap()
            .get(procedure)
            .cloned()
            .ok_or_else(|| BridgeError::storage(format!("unknown procedure {}", procedure)))
    }

    async fn call(&self, procedure: &str, params: &[FieldValue]) -> BridgeResult<u64> {
        self.record(format!("CALL {}", procedure), params)
    }
}

/// Broker that records publishes and fails the first `failures` of them
#[derive(Default)]
pub struct FakeBroker {
    published: Mutex<Vec<OutboundMessage>>,
    subscriptions: Mutex<Vec<String>>,
    failures: AtomicUsize,
}

impl FakeBroker {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn subscribe(&self, pattern: &str, _qos: QoS) -> BridgeResult<()> {
        self.subscriptions.lock().unwrap().push(pattern.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> BridgeResult<()> {
        self.subscriptions.lock().unwrap().retain(|p| p != pattern);
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> BridgeResult<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BridgeError::publish("broker unavailable"));
        }
        self.published.lock().unwrap().push(message);
        Ok(())
    }
}

/// Audit sink that keeps every event in memory
#[derive(Default)]
pub struct MemoryAudit {
    pub messages: Mutex<Vec<MessageAudit>>,
    pub publishes: Mutex<Vec<PublishAudit>>,
}

#[async_trait]
impl AuditSink for MemoryAudit {
    async fn message(&self, event: &MessageAudit) {
        self.messages.lock().unwrap().push(event.clone());
    }

    async fn publish(&self, event: &PublishAudit) {
        self.publishes.lock().unwrap().push(event.clone());
    }
}
