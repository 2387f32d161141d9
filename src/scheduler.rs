//! Poll loop scheduling for outbound sources.

use crate::config::SchedulingMode;
use crate::model::SourceConfig;
use crate::poller::OutboundPoller;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    poller: Arc<OutboundPoller>,
    sources: Arc<Vec<SourceConfig>>,
    mode: SchedulingMode,
}

impl Scheduler {
    pub fn new(
        poller: Arc<OutboundPoller>,
        sources: Arc<Vec<SourceConfig>>,
        mode: SchedulingMode,
    ) -> Self {
        Self {
            poller,
            sources,
            mode,
        }
    }

    /// Sources that pass validation; the others are reported and skipped
    fn runnable(&self) -> Vec<SourceConfig> {
        self.sources
            .iter()
            .filter(|source| match source.validate() {
                Ok(()) => source.enabled,
                Err(e) => {
                    warn!("Skipping source '{}': {}", source.name, e);
                    false
                }
            })
            .cloned()
            .collect()
    }

    /// Run until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let sources = self.runnable();
        if sources.is_empty() {
            warn!("No enabled sources to publish, waiting for configuration");
            cancel.cancelled().await;
            return;
        }

        for source in &sources {
            info!(
                "  - {}: {}.{} ({} batch, {}s interval)",
                source.name,
                source.schema,
                source.table_name,
                source.batch_size,
                source.poll_interval().as_secs()
            );
        }

        match self.mode {
            SchedulingMode::Parallel => Self::run_parallel(self.poller, sources, cancel).await,
            SchedulingMode::Sequential => Self::run_sequential(self.poller, sources, cancel).await,
        }
    }

    async fn run_parallel(
        poller: Arc<OutboundPoller>,
        sources: Vec<SourceConfig>,
        cancel: CancellationToken,
    ) {
        info!("Starting {} parallel poll loops", sources.len());
        let mut loops = JoinSet::new();
        for source in sources {
            loops.spawn(Self::poll_loop(
                Arc::clone(&poller),
                source,
                cancel.clone(),
            ));
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!("Poll loop task failed: {}", e);
            }
        }
        info!("All poll loops stopped");
    }

    async fn poll_loop(poller: Arc<OutboundPoller>, source: SourceConfig, cancel: CancellationToken) {
        let interval = source.poll_interval();
        while !cancel.is_cancelled() {
            Self::tick(&poller, &source, &cancel).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Poll loop for {} stopped", source.name);
    }

    async fn run_sequential(
        poller: Arc<OutboundPoller>,
        sources: Vec<SourceConfig>,
        cancel: CancellationToken,
    ) {
        let interval = sources
            .iter()
            .map(SourceConfig::poll_interval)
            .min()
            .unwrap_or(Duration::from_secs(5));
        info!(
            "Starting sequential poll loop over {} sources every {:?}",
            sources.len(),
            interval
        );

        while !cancel.is_cancelled() {
            for source in &sources {
                if cancel.is_cancelled() {
                    break;
                }
                Self::tick(&poller, source, &cancel).await;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Sequential poll loop stopped");
    }

    async fn tick(poller: &OutboundPoller, source: &SourceConfig, cancel: &CancellationToken) {
        if let Err(e) = poller.tick(source, cancel).await {
            error!("Error polling source {}: {}", source.name, e);
        }
    }
}
