//! Run command implementation.

use crate::server::{start_server, ServerState};
use crate::telemetry::setup_telemetry;
use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use txrelay_core::health::HealthCheck;
use txrelay_core::kafka::{KafkaSourceBuilder, KafkaTransactionalSink};
use txrelay_core::metrics::RelayMetrics;
use txrelay_core::{Config, Error, Relay, RelaySettings};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Command line values that take precedence over the config file.
#[derive(Debug, Default, Args)]
pub struct Overrides {
    /// Override Kafka bootstrap servers (comma separated)
    #[arg(long)]
    pub bootstrap_servers: Option<String>,

    /// Override the topic records are consumed from
    #[arg(long)]
    pub source_topic: Option<String>,

    /// Override the topic records are relayed to
    #[arg(long)]
    pub destination_topic: Option<String>,

    /// Override consumer group
    #[arg(long)]
    pub consumer_group: Option<String>,

    /// Override the transactional identity
    #[arg(long)]
    pub transactional_id: Option<String>,
}

impl Overrides {
    /// Write the provided values into the config.
    pub fn apply(self, config: &mut Config) {
        if let Some(servers) = self.bootstrap_servers {
            config.kafka.bootstrap_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(topic) = self.source_topic {
            config.kafka.source_topic = topic;
        }
        if let Some(topic) = self.destination_topic {
            config.kafka.destination_topic = topic;
        }
        if let Some(group) = self.consumer_group {
            config.kafka.consumer_group = group;
        }
        if let Some(id) = self.transactional_id {
            config.kafka.transactional_id = id;
        }
    }
}

/// Run the relay until a signal or a fatal error.
pub async fn run(mut config: Config, overrides: Overrides) -> Result<()> {
    overrides.apply(&mut config);
    config.validate()?;

    info!(
        source = %config.kafka.source_topic,
        destination = %config.kafka.destination_topic,
        group = %config.kafka.consumer_group,
        transactional_id = %config.kafka.transactional_id,
        "Starting relay"
    );

    let health = Arc::new(HealthCheck::for_relay());
    let metrics = Arc::new(RelayMetrics::new()?);

    let source = KafkaSourceBuilder::new(config.kafka.clone()).build()?;
    let sink = KafkaTransactionalSink::new(&config.kafka)?;
    let settings = RelaySettings::from_config(&config);
    let exporter = setup_telemetry(&settings.service_name);

    let mut relay = Relay::builder(source, sink, settings)
        .exporter(exporter)
        .metrics(Arc::clone(&metrics))
        .health(Arc::clone(&health))
        .build();

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let server_state = Arc::new(ServerState {
        health: Arc::clone(&health),
        metrics: Arc::clone(&metrics),
    });
    tokio::spawn(start_server(
        server_state,
        config.monitoring.health_port,
        config.monitoring.metrics_port,
        shutdown_tx.subscribe(),
    ));

    let relay_shutdown = shutdown_tx.subscribe();
    let mut relay_task = tokio::spawn(async move { relay.run(relay_shutdown).await });

    let joined = tokio::select! {
        joined = &mut relay_task => joined,
        signal = wait_for_signal() => {
            signal?;
            let _ = shutdown_tx.send(());

            // The in-flight batch is committed or aborted before the relay returns
            let grace = Duration::from_secs(config.relay.shutdown_timeout_seconds);
            match tokio::time::timeout(grace, &mut relay_task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        timeout_seconds = config.relay.shutdown_timeout_seconds,
                        "Relay did not stop in time"
                    );
                    relay_task.abort();
                    return Err(Error::Shutdown.into());
                }
            }
        }
    };

    // Stop the HTTP servers whichever way the relay ended
    let _ = shutdown_tx.send(());

    let stats = joined.context("relay task panicked")??;
    info!(
        batches = stats.batches_committed,
        records = stats.records_relayed,
        aborted = stats.batches_aborted,
        "Relay stopped"
    );
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [kafka]
        bootstrap_servers = ["kafka:9092"]
        source_topic = "orders"
        destination_topic = "orders-relayed"
        consumer_group = "txrelay-orders"
        transactional_id = "txrelay-orders-0"
    "#;

    #[test]
    fn test_overrides_replace_file_values() {
        let mut config = Config::from_toml(CONFIG).unwrap();
        Overrides {
            bootstrap_servers: Some("a:9092, b:9092,".into()),
            destination_topic: Some("orders-copy".into()),
            transactional_id: Some("txrelay-orders-1".into()),
            ..Default::default()
        }
        .apply(&mut config);

        assert_eq!(config.kafka.bootstrap_servers, vec!["a:9092", "b:9092"]);
        assert_eq!(config.kafka.source_topic, "orders");
        assert_eq!(config.kafka.destination_topic, "orders-copy");
        assert_eq!(config.kafka.transactional_id, "txrelay-orders-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_are_validated() {
        let mut config = Config::from_toml(CONFIG).unwrap();
        Overrides {
            destination_topic: Some("orders".into()),
            ..Default::default()
        }
        .apply(&mut config);

        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
