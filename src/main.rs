use clap::Parser;
use ntriphub::{GatewayConfig, Hub, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ntriphub")]
#[command(about = "Gateway republishing NTRIP/TCP correction streams to MQTT")]
struct Args {
    /// Path to the sqlite source registry
    #[arg(long)]
    registry: Option<String>,

    /// Number of publish workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum concurrent dial attempts per reconciliation cycle
    #[arg(long)]
    dial_concurrency: Option<usize>,

    /// Seconds between reconciliation cycles
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Consecutive failed cycles before a source is disabled
    #[arg(long)]
    max_dial_failures: Option<u32>,

    /// Demultiplex RTCM frames onto message-type sub-topics
    #[arg(long)]
    demux: bool,

    /// Leading segment of every published topic
    #[arg(long)]
    topic_prefix: Option<String>,

    /// MQTT broker host
    #[arg(long)]
    mqtt_host: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    mqtt_port: Option<u16>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    // Environment first, command line on top.
    let mut config = GatewayConfig::from_env()?;
    if let Some(registry) = args.registry {
        config.registry_path = registry;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(dial_concurrency) = args.dial_concurrency {
        config.dial_concurrency = dial_concurrency;
    }
    if let Some(poll_interval) = args.poll_interval {
        config.poll_interval_secs = poll_interval;
    }
    if let Some(max_dial_failures) = args.max_dial_failures {
        config.max_dial_failures = max_dial_failures;
    }
    if args.demux {
        config.demux = true;
    }
    if let Some(topic_prefix) = args.topic_prefix {
        config.topic_prefix = topic_prefix;
    }
    if let Some(mqtt_host) = args.mqtt_host {
        config.mqtt_host = mqtt_host;
    }
    if let Some(mqtt_port) = args.mqtt_port {
        config.mqtt_port = mqtt_port;
    }

    info!("Starting ntriphub gateway");
    info!("Source registry: {}", config.registry_path);
    info!("Publish workers: {}", config.workers);
    info!("Dial fan-out: {}", config.dial_concurrency);
    info!("Reconciliation interval: {}s", config.poll_interval_secs);
    info!("Demux mode: {}", config.demux);
    info!("Topic prefix: {}", config.topic_prefix);
    info!(
        "MQTT broker: {}:{}",
        config.mqtt_host, config.mqtt_port
    );

    let hub = Arc::new(Hub::new(config)?);

    let runner = Arc::clone(&hub);
    let hub_handle = tokio::spawn(async move { runner.run().await });

    signal::ctrl_c()
        .await
        .map_err(|e| ntriphub::HubError::Internal(format!("signal handler: {}", e)))?;
    info!("Received Ctrl+C, shutting down gracefully...");
    hub.shutdown();

    match hub_handle.await {
        Ok(result) => result?,
        Err(e) => warn!("hub task did not shut down cleanly: {}", e),
    }

    info!("ntriphub shut down successfully");
    Ok(())
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
