//! Bounded publish retries with exponential backoff.

use crate::broker::{BrokerClient, OutboundMessage};
use crate::config::PublisherConfig;
use crate::model::DeliveryOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Delay before the retry that follows attempt number `attempt` (1-based)
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Bound on a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&PublisherConfig> for RetryPolicy {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            max_attempts: config.publish_attempts.max(1),
            base_delay: config.retry_base_delay(),
            attempt_timeout: config.publish_timeout(),
        }
    }
}

/// Publishes through a [`BrokerClient`], retrying failed attempts
pub struct RetryPublisher {
    broker: Arc<dyn BrokerClient>,
    policy: RetryPolicy,
}

impl RetryPublisher {
    pub fn new(broker: Arc<dyn BrokerClient>, policy: RetryPolicy) -> Self {
        Self { broker, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Publish with retries. Cancellation interrupts a backoff wait and
    /// returns a failed outcome.
    pub async fn publish(
        &self,
        message: &OutboundMessage,
        cancel: &CancellationToken,
    ) -> DeliveryOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let result =
                tokio::time::timeout(self.policy.attempt_timeout, self.broker.publish(message.clone()))
                    .await;

            match result {
                Ok(Ok(())) => return DeliveryOutcome::delivered(attempt),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "Publish to {} timed out after {:?}",
                        message.topic, self.policy.attempt_timeout
                    )
                }
            }

            if attempt == max_attempts {
                break;
            }

            let delay = backoff_delay(self.policy.base_delay, attempt);
            warn!(
                topic = %message.topic,
                attempt,
                max_attempts,
                "Publish failed: {}; retrying in {:?}",
                last_error,
                delay
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return DeliveryOutcome::failed(
                        attempt,
                        format!("Publishing cancelled after {} attempts: {}", attempt, last_error),
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        error!(
            topic = %message.topic,
            attempts = max_attempts,
            "Publish failed permanently: {}",
            last_error
        );
        DeliveryOutcome::failed(max_attempts, last_error)
    }
}
