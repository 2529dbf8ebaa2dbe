use clap::Parser;
use jobq_client::RemoteBroker;
use jobq_core::WEATHER_HANDLER;
use jobq_worker::{HandlerRegistry, WorkerConfig, WorkerPool};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "jobq-worker")]
#[command(about = "Job queue worker", long_about = None)]
struct Args {
    /// Broker address
    #[arg(short, long, env = "JOBQ_BROKER")]
    broker: Option<String>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Number of concurrent workers
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        WorkerConfig::default()
    };

    // CLI args override the file
    if let Some(broker) = args.broker {
        config.broker_address = broker;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker_id = Some(worker_id);
    }
    config.weather = config.weather.with_env_keys();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }

    let mut registry = HandlerRegistry::new();
    registry.register(WEATHER_HANDLER, config.weather.build_handler()?)?;
    tracing::info!("Registered handlers: {:?}", registry.names());

    let broker = match RemoteBroker::connect(&config.broker_address).await {
        Ok(broker) => {
            tracing::info!("Connected to broker at {}", config.broker_address);
            broker
        }
        Err(e) => {
            tracing::warn!("Broker not reachable yet ({}), workers will keep retrying", e);
            RemoteBroker::new(&config.broker_address)
        }
    };
    let broker = Arc::new(broker);

    let pool = WorkerPool::start(&config, broker.clone(), broker, Arc::new(registry));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    pool.shutdown().await;

    Ok(())
}
