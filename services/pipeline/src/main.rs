//! Vigil Pipeline
//!
//! Runs the frame producer, the batching consumer, or both:
//!
//! ```text
//! vigil [producer|consumer|both]
//! ```
//!
//! Configuration comes from `config/default`, `config/{RUN_MODE}` and
//! `VIGIL__...` environment variables.

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vigil_pipeline::config::LoggingConfig;
use vigil_pipeline::{orchestrator, Mode, PipelineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let mode: Mode = match std::env::args().nth(1) {
        Some(arg) => match arg.parse() {
            Ok(mode) => mode,
            Err(e) => {
                print_usage();
                anyhow::bail!(e);
            }
        },
        None => Mode::Both,
    };

    // Load configuration
    let config = PipelineConfig::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        mode = ?mode,
        streams = config.stream_sources.len(),
        brokers = %config.kafka.bootstrap_servers,
        inference = %config.inference.endpoint,
        "Starting Vigil pipeline"
    );

    if let Err(e) = orchestrator::run(config, mode, shutdown_signal()).await {
        error!(error = %format!("{:#}", e), "Pipeline failed");
        return Err(e);
    }

    info!("Vigil pipeline stopped");
    Ok(())
}

fn print_usage() {
    println!("Usage: vigil [producer|consumer|both]");
    println!();
    println!("Modes:");
    println!("  producer - Capture streams and publish frames to Kafka");
    println!("  consumer - Batch frames, run inference and store annotated frames");
    println!("  both     - Run producer and consumer in one process (default)");
    println!();
    println!("Environment variables:");
    println!("  RUN_MODE                         - Selects config/{{RUN_MODE}} (default: development)");
    println!("  VIGIL__KAFKA__BOOTSTRAP_SERVERS  - Kafka broker addresses");
    println!("  VIGIL__INFERENCE__ENDPOINT       - Model-serving endpoint");
    println!("  VIGIL__STORAGE__ENDPOINT_URL     - S3-compatible endpoint");
    println!("  RUST_LOG                         - Overrides the configured log level");
}

/// Initialize the tracing subscriber
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{},vigil_pipeline={}", config.level, config.level)))
        .context("Invalid log level")?
        .add_directive("rdkafka=warn".parse()?)
        .add_directive("gstreamer=warn".parse()?)
        .add_directive("aws_config=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
