//! Topic relay
//!
//! Consumes a Kafka topic and forwards every record to an HTTP target, with
//! per-key ordering, retry and dead-letter topics, and commit-after-terminal
//! offset handling.

use anyhow::Context;
use clap::Parser;
use relay_config::RelayConfig;
use relay_processor::{
    health, ConsumerLoop, FailureRouter, HealthServer, HttpProbe, HttpTarget, KafkaBroker,
    KafkaRecordProducer, KeyPartitioner, LoopSettings, Processor, ProcessorSettings,
    ReadinessAggregator, RecordProducer, RelayMetrics, Supervisor, TargetGateway, TargetProbe,
    DEFAULT_PROBE_TIMEOUT,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "topic-relay",
    version,
    about = "Relay Kafka records to an HTTP target",
    long_about = "Relay Kafka records to an HTTP target.\n\n\
                  Options are read from an optional YAML file, the JSON file named by\n\
                  SECRETS_FILE_LOCATION and the environment (KAFKA_BROKER, TOPIC, GROUP_ID,\n\
                  SENDING_PROTOCOL, TARGET, ...), the environment taking precedence."
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match RelayConfig::load(cli.config.clone()) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(if cli.verbose { "debug" } else { "info" }, cli.json_logs);
            error!(
                option = e.option_name().unwrap_or("-"),
                "Invalid configuration: {}", e
            );
            std::process::exit(1);
        }
    };

    let level = if cli.verbose { "debug" } else { config.log_level() };
    init_tracing(level, cli.json_logs || config.json_logs);

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: RelayConfig) -> anyhow::Result<()> {
    info!(
        topic = %config.topic,
        group_id = %config.group_id,
        target = %config.target,
        loops = config.consumer_threads,
        retry_topic = config.retry_topic.as_deref().unwrap_or("-"),
        dead_letter_topic = config.dead_letter_topic.as_deref().unwrap_or("-"),
        "Starting topic relay"
    );

    let metrics = RelayMetrics::new();

    // One connection pool for every loop
    let client = reqwest::Client::builder()
        .timeout(config.target_timeout())
        .build()
        .context("failed to build HTTP client")?;

    let transport = Arc::new(HttpTarget::with_client(
        client.clone(),
        &config.target,
        config.target_timeout(),
    ));
    let gateway =
        TargetGateway::new(transport, metrics.clone()).hide_payload(config.hide_consumed_message);

    let producer: Option<Arc<dyn RecordProducer>> =
        if config.retry_topic.is_some() || config.dead_letter_topic.is_some() {
            Some(Arc::new(
                KafkaRecordProducer::new(&config).context("failed to create Kafka producer")?,
            ))
        } else {
            None
        };
    let router = FailureRouter::new(
        producer,
        config.retry_topic.clone(),
        config.dead_letter_topic.clone(),
        config.retry_budget,
    );

    let partitioner = KeyPartitioner::new(config.dedup_partition_by_key, config.unkeyed_grouping);
    let loop_settings = LoopSettings {
        poll_timeout: config.poll_timeout(),
        poll_records: config.poll_records,
    };
    let processor_for = |processing_delay: Duration| {
        Processor::new(
            gateway.clone(),
            router.clone(),
            metrics.clone(),
            ProcessorSettings {
                concurrency: config.concurrency,
                concurrency_per_partition: config.concurrency_per_partition,
                processing_delay,
            },
        )
    };

    let mut supervisor = Supervisor::new(config.shutdown_grace_period());
    for id in 0..config.consumer_threads {
        let broker = KafkaBroker::new(&config, id)
            .with_context(|| format!("failed to create consumer {}", id))?;
        supervisor.spawn(ConsumerLoop::new(
            id,
            broker,
            config.topic.clone(),
            partitioner,
            processor_for(config.processing_delay()),
            metrics.clone(),
            loop_settings,
        ));
    }

    if let Some(retry_topic) = &config.retry_topic {
        let id = config.consumer_threads;
        let broker = KafkaBroker::new(&config, id).context("failed to create retry consumer")?;
        supervisor.spawn(ConsumerLoop::new(
            id,
            broker,
            retry_topic.clone(),
            partitioner,
            processor_for(config.retry_processing_delay()),
            metrics.clone(),
            loop_settings,
        ));
    }

    let (stop_health, mut health_stopped) = watch::channel(false);
    let health_task = if config.management_server_port != 0 {
        let probe = config
            .target_is_alive_http_endpoint
            .as_ref()
            .map(|url| {
                let probe = HttpProbe::new(client.clone(), url.clone())
                    .with_timeout(DEFAULT_PROBE_TIMEOUT.min(config.target_timeout()));
                Arc::new(probe) as Arc<dyn TargetProbe>
            });
        let readiness = Arc::new(ReadinessAggregator::new(
            supervisor.handles(),
            probe,
            config.readiness_quorum,
            metrics.clone(),
        ));
        let router = health::router(readiness, metrics.clone(), config.use_prometheus);
        let server = HealthServer::new(config.management_server_port, router);

        Some(tokio::spawn(server.serve(async move {
            let _ = health_stopped.wait_for(|stopped| *stopped).await;
        })))
    } else {
        if config.use_prometheus {
            warn!("USE_PROMETHEUS is set but MANAGEMENT_SERVER_PORT is 0, metrics are not served");
        }
        None
    };

    let exits = supervisor.run_until(shutdown_signal()).await;
    let _ = stop_health.send(true);

    if let Some(task) = health_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Health server error: {}", e),
            Err(e) => warn!("Health server task failed: {}", e),
        }
    }

    let failed: Vec<usize> = exits
        .iter()
        .filter(|(_, exit)| !exit.is_clean())
        .map(|(id, _)| *id)
        .collect();
    if !exits.is_empty() && failed.len() == exits.len() {
        anyhow::bail!("all consumer loops terminated abnormally: {:?}", failed);
    }

    info!("Topic relay stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Initialize tracing/logging
fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from(["topic-relay", "--config", "relay.yaml", "-v", "--json-logs"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("relay.yaml")));
        assert!(cli.verbose);
        assert!(cli.json_logs);
    }
}
