use crate::config::{BrokerConfig, StorageBackend};
use crate::metrics::{BrokerMetrics, MeteredQueue, MeteredStore};
use jobq_client::Dispatcher;
use jobq_core::{BrokerQueue, JobError, MemoryQueue, MemoryResultStore, ResultStore};
use jobq_persistence::{open_database, DurableQueue, RocksResultStore};
use jobq_protocol::{ClaimRequest, ErrorResponse, Message, MessageCodec, OkResponse};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Broker process state: owns the queue and result store and serves them
/// to remote workers and dispatchers over the TCP protocol.
pub struct Broker {
    config: Arc<BrokerConfig>,
    queue: Arc<dyn BrokerQueue>,
    store: Arc<dyn ResultStore>,
    dispatcher: Dispatcher,
    metrics: Arc<BrokerMetrics>,
    shutdown: CancellationToken,
}

impl Broker {
    /// Open the configured storage backend
    pub async fn open(config: BrokerConfig) -> anyhow::Result<Self> {
        let ttl = config.engine.result_ttl();

        let (queue, store): (Arc<dyn BrokerQueue>, Arc<dyn ResultStore>) =
            match config.persistence.backend {
                StorageBackend::Memory => {
                    info!("Using in-memory storage; jobs do not survive a restart");
                    (
                        Arc::new(MemoryQueue::new()),
                        Arc::new(MemoryResultStore::new(ttl)),
                    )
                }
                StorageBackend::Rocksdb => {
                    let db = open_database(&config.persistence.data_dir)?;
                    let queue = DurableQueue::open(db.clone(), MemoryQueue::new()).await?;
                    (Arc::new(queue), Arc::new(RocksResultStore::new(db, ttl)))
                }
            };

        Self::with_backends(config, queue, store)
    }

    pub fn with_backends(
        config: BrokerConfig,
        queue: Arc<dyn BrokerQueue>,
        store: Arc<dyn ResultStore>,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(BrokerMetrics::new()?);
        let queue: Arc<dyn BrokerQueue> = Arc::new(MeteredQueue::new(queue, metrics.clone()));
        let store: Arc<dyn ResultStore> = Arc::new(MeteredStore::new(store, metrics.clone()));

        let dispatcher = Dispatcher::new(queue.clone(), store.clone())
            .with_max_attempts(config.engine.max_attempts)
            .with_known_handlers(config.api.handlers.iter().cloned());

        Ok(Broker {
            config: Arc::new(config),
            queue,
            store,
            dispatcher,
            metrics,
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.broker.host, self.config.broker.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Broker listening on {}", addr);

        self.serve(listener).await
    }

    /// Serve the protocol on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            broker.background_tasks().await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            let broker = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = broker.handle_connection(stream).await {
                                    error!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutting down broker");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let mut framed = Framed::new(stream, MessageCodec);

        while let Some(result) = framed.next().await {
            match result {
                Ok(message) => {
                    let response = self.handle_message(message).await;
                    framed.send(response).await?;
                }
                Err(e) => {
                    warn!("Protocol error: {}", e);
                    framed
                        .send(Message::Error(ErrorResponse::protocol(e.to_string())))
                        .await?;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Serve one request against the local backends
    pub async fn handle_message(&self, message: Message) -> Message {
        let result = match message {
            Message::Enqueue(req) => self.queue.enqueue(req.envelope).await.and_then(ok_body),
            Message::Claim(req) => self.handle_claim(req).await,
            Message::Ack(req) => self.queue.ack(&req.lease).await.and_then(ok_body),
            Message::Nack(req) => self
                .queue
                .nack(req.lease, Duration::from_millis(req.delay_ms))
                .await
                .and_then(ok_body),
            Message::Depth(_) => self.queue.depth().await.and_then(ok_body),
            Message::CreateRecord(req) => self.store.create(req.record).await.and_then(ok_body),
            Message::GetRecord(req) => self.store.get(&req.id).await.and_then(ok_body),
            Message::ApplyEvent(req) => self.store.apply(&req.id, req.event).await.and_then(ok_body),
            Message::RemoveRecord(req) => self.store.remove(&req.id).await.and_then(ok_body),
            Message::ListRecords(req) => self
                .store
                .list(&req.handler_name, req.state)
                .await
                .and_then(ok_body),
            other => {
                return Message::Error(ErrorResponse::protocol(format!(
                    "Unsupported message type: {:?}",
                    other.message_type()
                )))
            }
        };

        match result {
            Ok(body) => Message::Ok(OkResponse { body }),
            Err(e) => {
                debug!("Request failed: {}", e);
                Message::Error(ErrorResponse::from(&e))
            }
        }
    }

    async fn handle_claim(&self, req: ClaimRequest) -> jobq_core::Result<serde_json::Value> {
        let visibility = match req.visibility_ms {
            0 => self.config.engine.visibility_timeout(),
            ms => Duration::from_millis(ms),
        };
        let wait = Duration::from_millis(req.wait_ms).min(self.config.max_claim_wait());

        let lease = self.queue.claim(visibility, wait).await?;
        ok_body(lease)
    }

    /// Periodic lease reaping, record purging and gauge refresh
    async fn background_tasks(&self) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = self.shutdown.cancelled() => {
                    break;
                }
            }
        }
    }

    pub async fn sweep(&self) {
        match self.queue.reap_expired().await {
            Ok(0) => {}
            Ok(reaped) => {
                warn!("Returned {} expired leases to the queue", reaped);
                self.metrics.leases_reaped.inc_by(reaped as u64);
            }
            Err(e) => error!("Lease reaping failed: {}", e),
        }

        if let Err(e) = self.store.purge_expired().await {
            error!("Record purge failed: {}", e);
        }

        match self.queue.depth().await {
            Ok(depth) => self.metrics.update_queue_depth(&depth),
            Err(e) => error!("Queue depth unavailable: {}", e),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<dyn BrokerQueue> {
        self.queue.clone()
    }

    /// The metered result store every writer should use
    pub fn store(&self) -> Arc<dyn ResultStore> {
        self.store.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        self.metrics.clone()
    }

    /// Stop accepting connections and stop the sweep
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn ok_body<T: Serialize>(value: T) -> jobq_core::Result<serde_json::Value> {
    serde_json::to_value(value).map_err(JobError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_client::RemoteBroker;
    use jobq_core::{JobEnvelope, JobEvent, JobRecord, JobState};
    use serde_json::json;

    fn memory_broker() -> Arc<Broker> {
        let config = BrokerConfig::default();
        let ttl = config.engine.result_ttl();
        Arc::new(
            Broker::with_backends(
                config,
                Arc::new(MemoryQueue::new()),
                Arc::new(MemoryResultStore::new(ttl)),
            )
            .unwrap(),
        )
    }

    async fn spawn_server(broker: Arc<Broker>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(broker.serve(listener));
        address
    }

    #[tokio::test]
    async fn test_remote_round_trip() {
        let broker = memory_broker();
        let remote = RemoteBroker::new(spawn_server(broker.clone()).await);

        let envelope = JobEnvelope::new("weather", json!({"cities": ["Seoul"]}), 3).unwrap();
        let id = envelope.id;
        ResultStore::create(&remote, JobRecord::pending(&envelope)).await.unwrap();
        remote.enqueue(envelope.clone()).await.unwrap();

        let lease = remote
            .claim(Duration::from_secs(30), Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.envelope, envelope);

        remote.apply(&id, JobEvent::Started { lease: lease.token }).await.unwrap();
        let record = remote
            .apply(
                &id,
                JobEvent::Succeeded { lease: lease.token, result: json!({"ok": 1}) },
            )
            .await
            .unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        remote.ack(&lease).await.unwrap();

        let listed = remote.list("weather", JobState::Succeeded).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);

        assert_eq!(remote.depth().await.unwrap().total(), 0);
        assert_eq!(broker.metrics().jobs_submitted.get(), 1);
        assert_eq!(
            broker.metrics().jobs_finished.with_label_values(&["succeeded"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_remote_errors_keep_their_kind() {
        let broker = memory_broker();
        let remote = RemoteBroker::new(spawn_server(broker.clone()).await);

        let envelope = JobEnvelope::new("weather", json!({}), 1).unwrap();
        remote.enqueue(envelope.clone()).await.unwrap();
        assert!(matches!(
            remote.enqueue(envelope.clone()).await,
            Err(JobError::Duplicate(_))
        ));

        assert!(matches!(
            remote.get(&envelope.id).await,
            Err(JobError::NotFound(_))
        ));

        let lease = remote.try_claim(Duration::from_secs(30)).await.unwrap().unwrap();
        remote.ack(&lease).await.unwrap();
        assert!(matches!(
            remote.ack(&lease).await,
            Err(JobError::LeaseExpired(_))
        ));
        assert_eq!(broker.metrics().jobs_submitted.get(), 1);
    }

    #[tokio::test]
    async fn test_sweep_reaps_expired_leases() {
        let broker = memory_broker();
        let queue = broker.queue();
        queue
            .enqueue(JobEnvelope::new("weather", json!({}), 1).unwrap())
            .await
            .unwrap();
        queue.try_claim(Duration::from_millis(10)).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.sweep().await;

        assert_eq!(broker.metrics().leases_reaped.get(), 1);
        assert_eq!(queue.depth().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_response_messages_are_rejected_as_requests() {
        let broker = memory_broker();
        assert!(matches!(
            broker.handle_message(Message::ok()).await,
            Message::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_rocksdb_backend_reloads_queue() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = BrokerConfig::default();
        config.persistence.data_dir = temp_dir.path().to_path_buf();

        let envelope = JobEnvelope::new("weather", json!({"cities": ["Accra"]}), 3).unwrap();
        {
            let broker = Broker::open(config.clone()).await.unwrap();
            broker
                .store()
                .create(JobRecord::pending(&envelope))
                .await
                .unwrap();
            broker.queue().enqueue(envelope.clone()).await.unwrap();
        }

        let broker = Broker::open(config).await.unwrap();
        assert_eq!(broker.queue().depth().await.unwrap().ready, 1);
        assert_eq!(
            broker.store().get(&envelope.id).await.unwrap().state,
            JobState::Pending
        );
    }
}
