//! Count-based configuration hot reload.
//!
//! The coordinator compares the number of enabled configs in the store with
//! the number last loaded. Any difference restarts the worker on a fresh
//! snapshot. Edits that keep the count unchanged are picked up on the next
//! restart of the process.

use crate::error::BridgeResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A worker whose configuration snapshot can be swapped
#[async_trait]
pub trait Reloadable: Send {
    fn name(&self) -> &str;

    /// Number of enabled configs currently in the store
    async fn count_enabled(&self) -> BridgeResult<usize>;

    /// Load a new snapshot, returning how many configs it holds.
    /// On error the previous snapshot stays in place.
    async fn reload(&mut self) -> BridgeResult<usize>;

    /// Begin processing with the current snapshot
    async fn start(&mut self) -> BridgeResult<()>;

    /// Stop processing, waiting a bounded time for in-flight work
    async fn stop(&mut self);
}

pub struct ConfigReloadCoordinator {
    interval: Duration,
}

impl ConfigReloadCoordinator {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Load, start and supervise `worker` until `shutdown` fires.
    ///
    /// Failing to load or start the first snapshot is fatal.
    pub async fn run<W: Reloadable>(
        &self,
        worker: &mut W,
        shutdown: CancellationToken,
    ) -> BridgeResult<()> {
        let mut loaded = worker.reload().await?;
        worker.start().await?;
        info!(
            "{}: started with {} configurations, checking for changes every {:?}",
            worker.name(),
            loaded,
            self.interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let current = match worker.count_enabled().await {
                Ok(count) => count,
                Err(e) => {
                    warn!("{}: configuration check failed, skipping: {}", worker.name(), e);
                    continue;
                }
            };
            if current == loaded {
                debug!("{}: configuration unchanged ({})", worker.name(), loaded);
                continue;
            }

            info!(
                "{}: configuration changed ({} -> {}), reloading",
                worker.name(),
                loaded,
                current
            );
            worker.stop().await;

            match worker.reload().await {
                Ok(count) => {
                    loaded = count;
                    info!("{}: reloaded {} configurations", worker.name(), count);
                }
                Err(e) => error!(
                    "{}: reload failed, restarting with previous configuration: {}",
                    worker.name(),
                    e
                ),
            }

            if let Err(e) = worker.start().await {
                error!("{}: failed to restart: {}", worker.name(), e);
            }
        }

        info!("{}: shutting down", worker.name());
        worker.stop().await;
        Ok(())
    }
}
