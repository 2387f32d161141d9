//! Outbound worker: runs the poll scheduler over the current source snapshot.

use crate::config::SchedulingMode;
use crate::error::BridgeResult;
use crate::model::SourceConfig;
use crate::poller::OutboundPoller;
use crate::reload::Reloadable;
use crate::scheduler::Scheduler;
use crate::store::ConfigStore;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct OutboundWorker {
    store: Arc<dyn ConfigStore>,
    poller: Arc<OutboundPoller>,
    sources: ArcSwap<Vec<SourceConfig>>,
    mode: SchedulingMode,
    grace: Duration,
    shutdown: CancellationToken,
    running: Option<Running>,
}

impl OutboundWorker {
    /// `shutdown` is the parent of every scheduler run's cancellation token
    pub fn new(
        store: Arc<dyn ConfigStore>,
        poller: Arc<OutboundPoller>,
        mode: SchedulingMode,
        grace: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            poller,
            sources: ArcSwap::from_pointee(Vec::new()),
            mode,
            grace,
            shutdown,
            running: None,
        }
    }

    pub fn sources(&self) -> Arc<Vec<SourceConfig>> {
        self.sources.load_full()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Reloadable for OutboundWorker {
    fn name(&self) -> &str {
        "publisher"
    }

    async fn count_enabled(&self) -> BridgeResult<usize> {
        self.store.count_enabled_source_configs().await
    }

    async fn reload(&mut self) -> BridgeResult<usize> {
        let sources = self.store.load_source_configs().await?;
        let count = sources.len();
        self.sources.store(Arc::new(sources));
        Ok(count)
    }

    async fn start(&mut self) -> BridgeResult<()> {
        if self.running.is_some() {
            self.stop().await;
        }

        let sources = self.sources.load_full();
        info!("Publishing from {} sources ({:?})", sources.len(), self.mode);

        let cancel = self.shutdown.child_token();
        let scheduler = Scheduler::new(Arc::clone(&self.poller), sources, self.mode);
        let handle = tokio::spawn(scheduler.run(cancel.clone()));
        self.running = Some(Running { cancel, handle });
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(Running { cancel, mut handle }) = self.running.take() else {
            return;
        };

        cancel.cancel();
        match tokio::time::timeout(self.grace, &mut handle).await {
            Ok(Ok(())) => info!("Publisher stopped"),
            Ok(Err(e)) => warn!("Publisher task ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    "In-flight polls did not finish within {:?}, aborting",
                    self.grace
                );
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QoS;
    use crate::retry::{RetryPolicy, RetryPublisher};
    use crate::store::MockConfigStore;
    use crate::testing::{FakeBroker, MemoryAudit};
    use crate::tracker::MockDeliveryTracker;
    use std::collections::BTreeMap;

    fn source(name: &str) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            enabled: true,
            schema: "public".to_string(),
            table_name: "table_a".to_string(),
            description: None,
            primary_key: "id".to_string(),
            group_column: None,
            where_clause: "1=1".to_string(),
            order_by: None,
            batch_size: 10,
            poll_interval_secs: 60,
            topic_pattern: "data/table_a/{id}".to_string(),
            qos: QoS::AtLeastOnce,
            retain: false,
            field_mapping: BTreeMap::new(),
        }
    }

    fn worker(store: MockConfigStore, shutdown: CancellationToken) -> OutboundWorker {
        let mut tracker = MockDeliveryTracker::new();
        tracker.expect_fetch_unsent().returning(|_| Ok(Vec::new()));
        let poller = OutboundPoller::new(
            Arc::new(tracker),
            RetryPublisher::new(Arc::new(FakeBroker::default()), RetryPolicy::default()),
            Arc::new(MemoryAudit::default()),
            3,
        );
        OutboundWorker::new(
            Arc::new(store),
            Arc::new(poller),
            SchedulingMode::Parallel,
            Duration::from_secs(1),
            shutdown,
        )
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut store = MockConfigStore::new();
        store
            .expect_load_source_configs()
            .returning(|| Ok(vec![source("a"), source("b")]));
        let mut worker = worker(store, CancellationToken::new());

        assert_eq!(worker.reload().await.unwrap(), 2);
        worker.start().await.unwrap();
        assert!(worker.is_running());

        worker.stop().await;
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_parent_shutdown_stops_scheduler() {
        let mut store = MockConfigStore::new();
        store
            .expect_load_source_configs()
            .returning(|| Ok(vec![source("a")]));
        let shutdown = CancellationToken::new();
        let mut worker = worker(store, shutdown.clone());

        worker.reload().await.unwrap();
        worker.start().await.unwrap();
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_count_uses_source_configs() {
        let mut store = MockConfigStore::new();
        store
            .expect_count_enabled_source_configs()
            .returning(|| Ok(5));
        let worker = worker(store, CancellationToken::new());

        assert_eq!(worker.count_enabled().await.unwrap(), 5);
    }
}
