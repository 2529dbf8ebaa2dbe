use crate::handler::HandlerRegistry;
use jobq_core::{ExecutionOutcome, JobEnvelope};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Runs one envelope through its registered handler.
///
/// The handler runs on its own task so a panic is caught and reported as an
/// unrecoverable failure instead of taking the worker down with it.
pub struct JobExecutor {
    registry: Arc<HandlerRegistry>,
    timeout: Option<Duration>,
}

impl JobExecutor {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        JobExecutor {
            registry,
            timeout: None,
        }
    }

    /// Treat runs longer than `timeout` as a recoverable failure
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub async fn execute(&self, envelope: &JobEnvelope) -> ExecutionOutcome {
        let job_id = envelope.id;

        let handler = match self.registry.get(&envelope.handler_name) {
            Some(handler) => handler,
            None => {
                error!(job_id = %job_id, "No handler registered for {}", envelope.handler_name);
                return ExecutionOutcome::UnrecoverableFailure(format!(
                    "Unknown handler: {}",
                    envelope.handler_name
                ));
            }
        };

        info!(
            job_id = %job_id,
            handler = %envelope.handler_name,
            attempt = envelope.attempt,
            "Executing job"
        );

        let payload = envelope.payload.clone();
        let mut task = tokio::spawn(async move { handler.run(payload).await });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    warn!(job_id = %job_id, "Job timed out after {:?}", limit);
                    return ExecutionOutcome::RecoverableFailure(format!(
                        "Handler timed out after {:?}",
                        limit
                    ));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(outcome) => {
                match &outcome {
                    ExecutionOutcome::Succeeded(_) => info!(job_id = %job_id, "Job completed successfully"),
                    ExecutionOutcome::RecoverableFailure(e) => warn!(job_id = %job_id, "Job failed, may retry: {}", e),
                    ExecutionOutcome::UnrecoverableFailure(e) => error!(job_id = %job_id, "Job failed: {}", e),
                }
                outcome
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(job_id = %job_id, "Handler panicked: {}", message);
                ExecutionOutcome::UnrecoverableFailure(format!("Handler panicked: {}", message))
            }
            Err(_) => {
                warn!(job_id = %job_id, "Handler task was cancelled");
                ExecutionOutcome::RecoverableFailure("Handler task was cancelled".to_string())
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, JobHandler};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        type Input = Value;
        type Output = Value;

        async fn handle(&self, input: Value) -> Result<Value, HandlerError> {
            Ok(input)
        }
    }

    struct SleepHandler;

    #[async_trait]
    impl JobHandler for SleepHandler {
        type Input = u64;
        type Output = ();

        async fn handle(&self, millis: u64) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(())
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl JobHandler for PanicHandler {
        type Input = Value;
        type Output = ();

        async fn handle(&self, _input: Value) -> Result<(), HandlerError> {
            panic!("boom");
        }
    }

    fn executor() -> JobExecutor {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", EchoHandler).unwrap();
        registry.register("sleep", SleepHandler).unwrap();
        registry.register("panic", PanicHandler).unwrap();
        JobExecutor::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_executor_success() {
        let envelope = JobEnvelope::new("echo", json!({"city": "Quito"}), 3).unwrap();
        assert_eq!(
            executor().execute(&envelope).await,
            ExecutionOutcome::Succeeded(json!({"city": "Quito"}))
        );
    }

    #[tokio::test]
    async fn test_unknown_handler_is_unrecoverable() {
        let envelope = JobEnvelope::new("geocode", json!({}), 3).unwrap();
        assert!(matches!(
            executor().execute(&envelope).await,
            ExecutionOutcome::UnrecoverableFailure(msg) if msg.contains("geocode")
        ));
    }

    #[tokio::test]
    async fn test_panic_is_unrecoverable() {
        let envelope = JobEnvelope::new("panic", json!({}), 3).unwrap();
        assert_eq!(
            executor().execute(&envelope).await,
            ExecutionOutcome::UnrecoverableFailure("Handler panicked: boom".into())
        );
    }

    #[tokio::test]
    async fn test_executor_timeout() {
        let executor = executor().with_timeout(Some(Duration::from_millis(50)));
        let envelope = JobEnvelope::new("sleep", json!(2_000), 3).unwrap();

        assert!(matches!(
            executor.execute(&envelope).await,
            ExecutionOutcome::RecoverableFailure(msg) if msg.contains("timed out")
        ));
    }
}
