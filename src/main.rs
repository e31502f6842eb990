use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dispatch_lite::bus::{AmqpConsumer, AmqpProducer};
use dispatch_lite::config::SchedulerConfig;
use dispatch_lite::persist::RestClient;
use dispatch_lite::shutdown::install_shutdown_handler;
use dispatch_lite::TaskManager;

#[derive(Parser, Debug)]
#[command(name = "dispatch-lite")]
#[command(about = "A load-aware task dispatch scheduler over AMQP")]
struct Args {
    /// Path to a .env file with bus and persistence settings
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = dotenvy::from_path(&args.env_file) {
        tracing::warn!(path = %args.env_file.display(), error = %e, "No .env file loaded");
    }

    let config = SchedulerConfig::from_env()?;
    let shutdown = install_shutdown_handler();

    let consumer = Arc::new(AmqpConsumer::connect(&config.bus, shutdown.clone()).await?);
    let producer = Arc::new(AmqpProducer::connect(&config.bus).await?);
    let persistence = Arc::new(RestClient::new(&config.persistence));

    let manager = TaskManager::init(
        config,
        consumer.clone(),
        producer.clone(),
        persistence,
        shutdown.clone(),
    )
    .await?;
    manager.start();

    tracing::info!("Scheduler running, waiting for shutdown signal");
    shutdown.cancelled().await;

    if let Err(e) = consumer.close().await {
        tracing::warn!(error = %e, "Error closing bus consumer");
    }
    if let Err(e) = producer.close().await {
        tracing::warn!(error = %e, "Error closing bus producer");
    }
    tracing::info!("Shutdown complete");

    Ok(())
}
