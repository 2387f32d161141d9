//! Inbound worker: broker subscriptions and per-message dispatch.

use crate::audit::AuditSink;
use crate::broker::{BrokerClient, InboundMessage};
use crate::error::{BridgeError, BridgeResult};
use crate::model::{QoS, RouteConfig};
use crate::reload::Reloadable;
use crate::router::{InboundRouter, MessageState};
use crate::store::ConfigStore;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Routes inbound messages one at a time, in arrival order
pub struct MessageDispatcher {
    router: Arc<InboundRouter>,
    routes: Arc<ArcSwap<Vec<RouteConfig>>>,
    audit: Arc<dyn AuditSink>,
    gate: Arc<Mutex<()>>,
}

impl MessageDispatcher {
    pub async fn run(self, mut messages: Receiver<InboundMessage>, shutdown: CancellationToken) {
        info!("Message dispatcher started");
        let mut processed: u64 = 0;

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => message,
                    None => {
                        warn!("Inbound message channel closed");
                        break;
                    }
                },
            };

            // Held while routing so a reload waits for the in-flight message
            let _processing = self.gate.lock().await;
            let routes = self.routes.load_full();
            let report = self
                .router
                .route(&message.topic, &message.payload, &routes)
                .await;

            for event in &report.audits {
                self.audit.message(event).await;
            }
            if report.state == MessageState::Failed {
                debug!("Message on {} ended Failed", message.topic);
            }
            processed += 1;
        }

        info!("Message dispatcher stopped after {} messages", processed);
    }
}

/// Owner of the inbound route snapshot and the broker subscriptions
pub struct InboundWorker {
    store: Arc<dyn ConfigStore>,
    broker: Arc<dyn BrokerClient>,
    router: Arc<InboundRouter>,
    audit: Arc<dyn AuditSink>,
    routes: Arc<ArcSwap<Vec<RouteConfig>>>,
    gate: Arc<Mutex<()>>,
    paused: Option<OwnedMutexGuard<()>>,
    subscribed: Vec<String>,
    grace: Duration,
}

impl InboundWorker {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        broker: Arc<dyn BrokerClient>,
        router: Arc<InboundRouter>,
        audit: Arc<dyn AuditSink>,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            router,
            audit,
            routes: Arc::new(ArcSwap::from_pointee(Vec::new())),
            gate: Arc::new(Mutex::new(())),
            paused: None,
            subscribed: Vec::new(),
            grace,
        }
    }

    /// Dispatcher reading the same snapshot as this worker
    pub fn dispatcher(&self) -> MessageDispatcher {
        MessageDispatcher {
            router: Arc::clone(&self.router),
            routes: Arc::clone(&self.routes),
            audit: Arc::clone(&self.audit),
            gate: Arc::clone(&self.gate),
        }
    }

    pub fn routes(&self) -> Arc<Vec<RouteConfig>> {
        self.routes.load_full()
    }

    /// Distinct topic patterns of valid routes, with the highest QoS asked for
    fn patterns(routes: &[RouteConfig]) -> BTreeMap<String, QoS> {
        let mut patterns = BTreeMap::new();
        for route in routes {
            if let Err(e) = route.validate() {
                warn!("Skipping route '{}': {}", route.name, e);
                continue;
            }
            patterns
                .entry(route.topic_pattern.clone())
                .and_modify(|qos: &mut QoS| {
                    if route.qos.level() > qos.level() {
                        *qos = route.qos;
                    }
                })
                .or_insert(route.qos);
        }
        patterns
    }
}

#[async_trait]
impl Reloadable for InboundWorker {
    fn name(&self) -> &str {
        "receiver"
    }

    async fn count_enabled(&self) -> BridgeResult<usize> {
        self.store.count_enabled_route_configs().await
    }

    async fn reload(&mut self) -> BridgeResult<usize> {
        let routes = self.store.load_route_configs().await?;
        let count = routes.len();
        self.routes.store(Arc::new(routes));
        self.router.inserter().clear_cache().await;
        Ok(count)
    }

    async fn start(&mut self) -> BridgeResult<()> {
        let routes = self.routes.load_full();
        let result = async {
            for (pattern, qos) in Self::patterns(&routes) {
                self.broker.subscribe(&pattern, qos).await?;
                self.subscribed.push(pattern);
            }
            Ok::<(), BridgeError>(())
        }
        .await;

        // Release messages held back during the reload
        self.paused = None;
        info!(
            "Receiver listening on {} topic patterns for {} routes",
            self.subscribed.len(),
            routes.len()
        );
        result
    }

    async fn stop(&mut self) {
        for pattern in std::mem::take(&mut self.subscribed) {
            if let Err(e) = self.broker.unsubscribe(&pattern).await {
                warn!("Failed to unsubscribe from {}: {}", pattern, e);
            }
        }

        if self.paused.is_none() {
            match tokio::time::timeout(self.grace, Arc::clone(&self.gate).lock_owned()).await {
                Ok(guard) => self.paused = Some(guard),
                Err(_) => warn!(
                    "In-flight message still processing after {:?}, continuing",
                    self.grace
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insert::Inserter;
    use crate::model::{InsertMode, QoS, TableMapping};
    use crate::store::MockConfigStore;
    use crate::testing::{FakeBroker, MemoryAudit, RecordingStorage};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn route(name: &str, pattern: &str, qos: QoS) -> RouteConfig {
        RouteConfig {
            id: 1,
            name: name.to_string(),
            topic_pattern: pattern.to_string(),
            description: None,
            message_format: "JSON".to_string(),
            field_mapping: BTreeMap::new(),
            qos,
            enabled: true,
            table_mappings: vec![TableMapping {
                target_schema: "dbo".to_string(),
                target_table: "TableA".to_string(),
                insert_mode: InsertMode::Direct,
                stored_proc_name: None,
                column_mapping: [("Reading".to_string(), "Value".to_string())]
                    .into_iter()
                    .collect(),
                filter_condition: None,
                enabled: true,
                priority: 0,
                continue_on_error: true,
            }],
        }
    }

    struct Harness {
        worker: InboundWorker,
        broker: Arc<FakeBroker>,
        storage: Arc<RecordingStorage>,
        audit: Arc<MemoryAudit>,
    }

    fn harness(store: MockConfigStore) -> Harness {
        let storage = Arc::new(RecordingStorage::default());
        let broker = Arc::new(FakeBroker::default());
        let audit = Arc::new(MemoryAudit::default());
        let router = Arc::new(InboundRouter::new(Inserter::new(storage.clone())));
        let worker = InboundWorker::new(
            Arc::new(store),
            broker.clone(),
            router,
            audit.clone(),
            Duration::from_millis(50),
        );
        Harness {
            worker,
            broker,
            storage,
            audit,
        }
    }

    #[tokio::test]
    async fn test_subscribes_distinct_patterns() {
        let mut store = MockConfigStore::new();
        store.expect_load_route_configs().returning(|| {
            Ok(vec![
                route("a", "sensor/+/temperature", QoS::AtMostOnce),
                route("b", "sensor/+/temperature", QoS::ExactlyOnce),
                route("c", "", QoS::AtMostOnce),
                route("d", "plant/#", QoS::AtLeastOnce),
            ])
        });
        let mut h = harness(store);

        assert_eq!(h.worker.reload().await.unwrap(), 4);
        h.worker.start().await.unwrap();
        assert_eq!(
            h.broker.subscriptions(),
            vec!["plant/#", "sensor/+/temperature"]
        );

        h.worker.stop().await;
        assert!(h.broker.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_snapshot() {
        let mut store = MockConfigStore::new();
        let mut calls = 0;
        store.expect_load_route_configs().returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(vec![route("a", "sensor/#", QoS::AtLeastOnce)])
            } else {
                Err(BridgeError::config("store unreachable"))
            }
        });
        let mut h = harness(store);

        h.worker.reload().await.unwrap();
        assert!(h.worker.reload().await.is_err());
        assert_eq!(h.worker.routes().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatcher_routes_and_audits() {
        let mut store = MockConfigStore::new();
        store
            .expect_load_route_configs()
            .returning(|| Ok(vec![route("temp", "sensor/+/temperature", QoS::AtLeastOnce)]));
        let mut h = harness(store);
        h.worker.reload().await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.worker.dispatcher().run(rx, shutdown.clone()));

        tx.send(InboundMessage {
            topic: "sensor/device3/temperature".to_string(),
            payload: Bytes::from_static(br#"{"Value": 82.5}"#),
            retain: false,
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(h.storage.statements().len(), 1);
        let audits = h.audit.messages.lock().unwrap();
        assert_eq!(audits.len(), 1);
        assert!(audits[0].success);
        assert_eq!(audits[0].tables_affected, 1);
    }
}
