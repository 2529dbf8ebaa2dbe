use crate::config::WorkerConfig;
use crate::executor::JobExecutor;
use crate::handler::HandlerRegistry;
use crate::worker::Worker;
use jobq_core::{BrokerQueue, ResultStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A fixed set of workers running on the current runtime
pub struct WorkerPool {
    workers: JoinSet<()>,
    shutdown: CancellationToken,
    graceful_shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawn `config.concurrency` workers against the given backends
    pub fn start(
        config: &WorkerConfig,
        queue: Arc<dyn BrokerQueue>,
        store: Arc<dyn ResultStore>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let executor = Arc::new(JobExecutor::new(registry).with_timeout(config.handler_timeout()));
        let base_id = config.generate_worker_id();

        let mut workers = JoinSet::new();
        for n in 0..config.concurrency.max(1) {
            let worker = Worker::new(
                format!("{}-{}", base_id, n),
                queue.clone(),
                store.clone(),
                executor.clone(),
            )
            .with_retry_policy(config.engine.retry_policy())
            .with_visibility_timeout(config.engine.visibility_timeout())
            .with_claim_wait(config.engine.claim_wait())
            .with_error_backoff(config.claim_error_backoff());

            let token = shutdown.clone();
            workers.spawn(async move { worker.run(token).await });
        }

        info!(
            "Started worker pool {} (concurrency: {}, handlers: {:?})",
            base_id,
            workers.len(),
            executor.registry().names()
        );

        WorkerPool {
            workers,
            shutdown,
            graceful_shutdown_timeout: config.graceful_shutdown_timeout(),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Token that stops every worker in the pool when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop claiming and wait for in-flight jobs, up to the graceful timeout
    pub async fn shutdown(mut self) {
        info!("Waiting for active jobs to complete...");
        self.shutdown.cancel();

        let deadline = self.graceful_shutdown_timeout;
        let workers = &mut self.workers;
        let drain = async move {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!("Worker task ended abnormally: {}", e);
                }
            }
        };

        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!(
                "Shutdown deadline exceeded, aborting {} workers",
                self.workers.len()
            );
            self.workers.abort_all();
        } else {
            info!("All workers stopped");
        }
    }
}
