use axum::Router;
use clap::Parser;
use jobq_broker::config::StorageBackend;
use jobq_broker::{Broker, BrokerConfig};
use jobq_core::WEATHER_HANDLER;
use jobq_worker::{HandlerRegistry, WorkerPool};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "jobq-broker")]
#[command(about = "Job queue broker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Broker host
    #[arg(long)]
    host: Option<String>,

    /// Broker port
    #[arg(long)]
    port: Option<u16>,

    /// REST API port
    #[arg(long)]
    rest_port: Option<u16>,

    /// Storage backend (memory or rocksdb)
    #[arg(long, value_parser = parse_backend)]
    backend: Option<StorageBackend>,

    /// RocksDB data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of workers to run inside the broker process
    #[arg(long)]
    workers: Option<usize>,
}

fn parse_backend(value: &str) -> Result<StorageBackend, String> {
    match value {
        "memory" => Ok(StorageBackend::Memory),
        "rocksdb" => Ok(StorageBackend::Rocksdb),
        other => Err(format!("unknown backend '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_missing = !std::path::Path::new(&args.config).exists();
    let mut config = if config_missing {
        BrokerConfig::default()
    } else {
        BrokerConfig::from_file(&args.config)?
    };

    // Override with CLI args
    if let Some(host) = args.host {
        config.broker.host = host;
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(rest_port) = args.rest_port {
        config.api.rest_port = rest_port;
    }
    if let Some(backend) = args.backend {
        config.persistence.backend = backend;
    }
    if let Some(data_dir) = args.data_dir {
        config.persistence.data_dir = data_dir;
    }
    if let Some(workers) = args.workers {
        config.workers.count = workers;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.monitoring.log_level));
    let subscriber = tracing_subscriber::registry().with(filter);
    if config.monitoring.log_format == "json" {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }

    if config_missing {
        tracing::warn!("Config file {} not found, using defaults", args.config);
    }
    tracing::info!("Starting broker with config: {:?}", config);

    let broker = Arc::new(Broker::open(config.clone()).await?);

    // Start REST API
    let api_broker = broker.clone();
    let rest_port = config.api.rest_port;
    tokio::spawn(async move {
        if let Err(e) = start_rest_api(api_broker, rest_port).await {
            tracing::error!("REST API error: {}", e);
        }
    });

    // Start metrics server
    let metrics_broker = broker.clone();
    let metrics_port = config.monitoring.prometheus_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_broker, metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    let pool = if config.workers.count > 0 {
        Some(start_embedded_workers(&broker, &config)?)
    } else {
        None
    };

    let server = tokio::spawn(broker.clone().run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    broker.shutdown();
    server.await??;

    Ok(())
}

fn start_embedded_workers(broker: &Broker, config: &BrokerConfig) -> anyhow::Result<WorkerPool> {
    let mut worker_config = config.to_worker_config();
    worker_config.weather = worker_config.weather.with_env_keys();

    let mut registry = HandlerRegistry::new();
    registry.register(WEATHER_HANDLER, worker_config.weather.build_handler()?)?;

    tracing::info!("Starting {} embedded workers", worker_config.concurrency);
    Ok(WorkerPool::start(
        &worker_config,
        broker.queue(),
        broker.store(),
        Arc::new(registry),
    ))
}

async fn start_rest_api(broker: Arc<Broker>, port: u16) -> anyhow::Result<()> {
    use jobq_broker::api::create_rest_api;

    let app = create_rest_api(broker);
    let addr = format!("0.0.0.0:{}", port);

    tracing::info!("REST API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn start_metrics_server(broker: Arc<Broker>, port: u16) -> anyhow::Result<()> {
    use axum::{extract::State, http::StatusCode, routing::get};

    async fn metrics_handler(State(broker): State<Arc<Broker>>) -> (StatusCode, String) {
        match broker.metrics().render() {
            Ok(text) => (StatusCode::OK, text),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(broker);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
