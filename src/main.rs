//! MQTT <-> SQL bridge process
//!
//! Runs the receiver and publisher halves side by side until Ctrl-C.

use anyhow::Context;
use mqtt_sql_bridge::audit::{AuditSink, LogAuditSink, StorageAuditSink};
use mqtt_sql_bridge::broker::MqttBroker;
use mqtt_sql_bridge::config::{AuditSinkKind, BridgeConfig, ConfigStoreKind};
use mqtt_sql_bridge::insert::Inserter;
use mqtt_sql_bridge::poller::OutboundPoller;
use mqtt_sql_bridge::publisher::OutboundWorker;
use mqtt_sql_bridge::receiver::InboundWorker;
use mqtt_sql_bridge::reload::ConfigReloadCoordinator;
use mqtt_sql_bridge::retry::{RetryPolicy, RetryPublisher};
use mqtt_sql_bridge::router::InboundRouter;
use mqtt_sql_bridge::storage::{PgStorage, Storage};
use mqtt_sql_bridge::store::{ConfigStore, FileConfigStore, SqlConfigStore};
use mqtt_sql_bridge::tracker::SqlDeliveryTracker;
use mqtt_sql_bridge::BridgeResult;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging first
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,mqtt_sql_bridge=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .ok(); // Ignore error if already initialized

    tracing::info!("Starting MQTT SQL Bridge");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load unified configuration from single file (TOML + ENV overrides)
    let config = BridgeConfig::load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;

    config.validate()?;

    tracing::info!("Configuration loaded and validated successfully");
    tracing::info!(
        "MQTT Broker: {}:{}",
        config.mqtt.broker_host,
        config.mqtt.broker_port
    );
    tracing::info!("Config store: {:?}", config.config_store.kind);
    tracing::info!(
        "Receiver: {}, Publisher: {} ({:?})",
        if config.receiver.enabled { "enabled" } else { "disabled" },
        if config.publisher.enabled { "enabled" } else { "disabled" },
        config.publisher.scheduling
    );

    let storage: Arc<dyn Storage> =
        Arc::new(PgStorage::new(&config.database).context("Failed to create database pool")?);
    let schema = config.config_store.schema.as_str();

    let store: Arc<dyn ConfigStore> = match config.config_store.kind {
        ConfigStoreKind::Sql => Arc::new(SqlConfigStore::new(Arc::clone(&storage), schema)?),
        ConfigStoreKind::File => {
            // Presence checked by validate()
            let path = config
                .config_store
                .path
                .clone()
                .context("config_store.path is required for the File store")?;
            Arc::new(FileConfigStore::new(path))
        }
    };

    let audit: Arc<dyn AuditSink> = match config.audit.sink {
        AuditSinkKind::Log => Arc::new(LogAuditSink),
        AuditSinkKind::Storage => Arc::new(StorageAuditSink::new(Arc::clone(&storage), schema)?),
    };

    let shutdown = CancellationToken::new();
    let mut halves: JoinSet<BridgeResult<()>> = JoinSet::new();
    let mut brokers = Vec::new();

    if config.receiver.enabled {
        let (broker, messages) = MqttBroker::connect(&config.mqtt, "receiver", shutdown.clone());
        let broker = Arc::new(broker);
        brokers.push(Arc::clone(&broker));

        let router = Arc::new(InboundRouter::new(Inserter::new(Arc::clone(&storage))));
        let mut worker = InboundWorker::new(
            Arc::clone(&store),
            broker,
            router,
            Arc::clone(&audit),
            config.receiver.shutdown_grace(),
        );

        let dispatcher = worker.dispatcher();
        let token = shutdown.clone();
        halves.spawn(async move {
            dispatcher.run(messages, token).await;
            Ok(())
        });

        let coordinator = ConfigReloadCoordinator::new(config.receiver.reload_interval());
        let token = shutdown.clone();
        halves.spawn(async move { coordinator.run(&mut worker, token).await });
    }

    if config.publisher.enabled {
        // Incoming publishes are not used on this connection
        let (broker, _messages) = MqttBroker::connect(&config.mqtt, "publisher", shutdown.clone());
        let broker = Arc::new(broker);
        brokers.push(Arc::clone(&broker));

        let tracker = Arc::new(SqlDeliveryTracker::new(Arc::clone(&storage), schema)?);
        let publisher = RetryPublisher::new(broker, RetryPolicy::from(&config.publisher));
        let poller = Arc::new(OutboundPoller::new(
            tracker,
            publisher,
            Arc::clone(&audit),
            config.publisher.max_retry_attempts,
        ));
        let mut worker = OutboundWorker::new(
            Arc::clone(&store),
            poller,
            config.publisher.scheduling,
            config.publisher.shutdown_grace(),
            shutdown.clone(),
        );

        let coordinator = ConfigReloadCoordinator::new(config.publisher.reload_interval());
        let token = shutdown.clone();
        halves.spawn(async move { coordinator.run(&mut worker, token).await });
    }

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    let mut failure = None;
    while let Some(result) = halves.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Bridge worker failed: {}", e);
                failure.get_or_insert(anyhow::Error::from(e));
                shutdown.cancel();
            }
            Err(e) => {
                tracing::error!("Bridge task panicked: {}", e);
                shutdown.cancel();
            }
        }
    }

    for broker in brokers {
        match Arc::try_unwrap(broker) {
            Ok(broker) => broker.shutdown().await,
            Err(_) => tracing::warn!("MQTT client still in use at shutdown"),
        }
    }

    tracing::info!("MQTT SQL Bridge stopped");
    failure.map_or(Ok(()), Err)
}
