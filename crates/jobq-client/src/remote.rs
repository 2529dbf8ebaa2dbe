use crate::{ClientError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use jobq_core::{
    BrokerQueue, JobEnvelope, JobEvent, JobId, JobRecord, JobState, Lease, QueueDepth,
    ResultStore,
};
use jobq_protocol::{
    AckRequest, ApplyEventRequest, ClaimRequest, CreateRecordRequest, DepthRequest,
    EnqueueRequest, GetRecordRequest, ListRecordsRequest, Message, MessageCodec, NackRequest,
    RemoveRecordRequest,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Queue and result store living in a broker process, reached over TCP.
///
/// Each request opens its own connection, so a `RemoteBroker` is cheap to
/// share between worker tasks. Lease reaping and record purging are left to
/// the broker's own sweep; the corresponding calls here are no-ops.
#[derive(Debug, Clone)]
pub struct RemoteBroker {
    broker_address: String,
    request_timeout: Duration,
}

impl RemoteBroker {
    pub fn new(broker_address: impl Into<String>) -> Self {
        RemoteBroker {
            broker_address: broker_address.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Connect once to check the broker is reachable
    pub async fn connect(broker_address: impl Into<String>) -> Result<Self> {
        let broker = Self::new(broker_address);
        TcpStream::connect(&broker.broker_address)
            .await
            .map_err(|e| ClientError::ConnectionError(e.to_string()))?;
        Ok(broker)
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn broker_address(&self) -> &str {
        &self.broker_address
    }

    /// Send one request and decode the `Ok` body as `T`
    async fn call<T: DeserializeOwned>(
        &self,
        message: Message,
        extra_wait: Duration,
    ) -> jobq_core::Result<T> {
        let limit = self.request_timeout + extra_wait;

        let response = match tokio::time::timeout(limit, self.exchange(message)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(limit)),
        };

        let body = match response.map_err(ClientError::into_job_error)? {
            Message::Ok(resp) => resp.body,
            Message::Error(resp) => return Err(resp.into_job_error()),
            other => {
                return Err(ClientError::ProtocolError(format!(
                    "Unexpected response: {:?}",
                    other.message_type()
                ))
                .into_job_error())
            }
        };

        Ok(serde_json::from_value(body)?)
    }

    async fn exchange(&self, message: Message) -> Result<Message> {
        let stream = TcpStream::connect(&self.broker_address)
            .await
            .map_err(|e| ClientError::ConnectionError(e.to_string()))?;

        let mut framed = Framed::new(stream, MessageCodec);
        framed
            .send(message)
            .await
            .map_err(|e| ClientError::ProtocolError(e.to_string()))?;

        match framed.next().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(ClientError::ProtocolError(e.to_string())),
            None => Err(ClientError::ConnectionError("Connection closed".to_string())),
        }
    }
}

#[async_trait]
impl BrokerQueue for RemoteBroker {
    async fn enqueue(&self, envelope: JobEnvelope) -> jobq_core::Result<()> {
        let id = envelope.id;
        let _: Value = self
            .call(Message::Enqueue(EnqueueRequest { envelope }), Duration::ZERO)
            .await?;
        debug!(job_id = %id, broker = %self.broker_address, "Enqueued remotely");
        Ok(())
    }

    async fn try_claim(&self, visibility_timeout: Duration) -> jobq_core::Result<Option<Lease>> {
        self.claim(visibility_timeout, Duration::ZERO).await
    }

    async fn claim(
        &self,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> jobq_core::Result<Option<Lease>> {
        let request = ClaimRequest {
            visibility_ms: visibility_timeout.as_millis() as u64,
            wait_ms: wait.as_millis() as u64,
        };
        self.call(Message::Claim(request), wait).await
    }

    async fn ack(&self, lease: &Lease) -> jobq_core::Result<()> {
        let request = AckRequest {
            lease: lease.clone(),
        };
        let _: Value = self.call(Message::Ack(request), Duration::ZERO).await?;
        Ok(())
    }

    async fn nack(&self, lease: Lease, delay: Duration) -> jobq_core::Result<()> {
        let request = NackRequest {
            lease,
            delay_ms: delay.as_millis() as u64,
        };
        let _: Value = self.call(Message::Nack(request), Duration::ZERO).await?;
        Ok(())
    }

    async fn reap_expired(&self) -> jobq_core::Result<usize> {
        Ok(0)
    }

    async fn depth(&self) -> jobq_core::Result<QueueDepth> {
        self.call(Message::Depth(DepthRequest::default()), Duration::ZERO)
            .await
    }
}

#[async_trait]
impl ResultStore for RemoteBroker {
    async fn create(&self, record: JobRecord) -> jobq_core::Result<()> {
        let _: Value = self
            .call(Message::CreateRecord(CreateRecordRequest { record }), Duration::ZERO)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &JobId) -> jobq_core::Result<JobRecord> {
        self.call(Message::GetRecord(GetRecordRequest { id: *id }), Duration::ZERO)
            .await
    }

    async fn apply(&self, id: &JobId, event: JobEvent) -> jobq_core::Result<JobRecord> {
        self.call(
            Message::ApplyEvent(ApplyEventRequest { id: *id, event }),
            Duration::ZERO,
        )
        .await
    }

    async fn remove(&self, id: &JobId) -> jobq_core::Result<()> {
        let _: Value = self
            .call(Message::RemoveRecord(RemoveRecordRequest { id: *id }), Duration::ZERO)
            .await?;
        Ok(())
    }

    async fn list(&self, handler_name: &str, state: JobState) -> jobq_core::Result<Vec<JobRecord>> {
        let request = ListRecordsRequest {
            handler_name: handler_name.to_string(),
            state,
        };
        self.call(Message::ListRecords(request), Duration::ZERO).await
    }

    async fn purge_expired(&self) -> jobq_core::Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::JobError;
    use jobq_protocol::{ErrorResponse, OkResponse};
    use serde_json::json;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    /// Address nothing is listening on
    async fn dead_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        address
    }

    /// Answer a single request with `response`
    async fn one_shot_server(response: Message) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, MessageCodec);
            let _request = framed.next().await.unwrap().unwrap();
            framed.send(response).await.unwrap();
        });

        address
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_unavailable() {
        let broker = RemoteBroker::new(dead_address().await);
        let envelope = JobEnvelope::new("weather", json!({}), 3).unwrap();

        assert!(matches!(
            broker.enqueue(envelope).await,
            Err(JobError::BrokerUnavailable(_))
        ));
        assert!(RemoteBroker::connect(dead_address().await).await.is_err());
    }

    #[tokio::test]
    async fn test_error_response_becomes_job_error() {
        let id = Uuid::new_v4();
        let address =
            one_shot_server(Message::Error(ErrorResponse::from(&JobError::NotFound(id)))).await;

        let broker = RemoteBroker::new(address);
        match broker.get(&id).await {
            Err(JobError::NotFound(missing)) => assert_eq!(missing, id),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_claim() {
        let address = one_shot_server(Message::Ok(OkResponse { body: Value::Null })).await;

        let broker = RemoteBroker::new(address);
        let lease = broker.try_claim(Duration::from_secs(30)).await.unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test]
    async fn test_unexpected_response_is_protocol_failure() {
        let address = one_shot_server(Message::Depth(DepthRequest::default())).await;

        let broker = RemoteBroker::new(address);
        assert!(matches!(
            broker.depth().await,
            Err(JobError::BrokerUnavailable(_))
        ));
    }
}
