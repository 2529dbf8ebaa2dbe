use async_trait::async_trait;
use jobq_core::ExecutionOutcome;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a handler, classified by the handler itself
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// Transient; the job is retried with backoff
    #[error("{0}")]
    Recoverable(String),

    /// Permanent; the job fails immediately
    #[error("{0}")]
    Unrecoverable(String),
}

/// A typed job handler.
///
/// Handlers may run more than once for the same job (delivery is
/// at-least-once), so they must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Input: DeserializeOwned + Send;
    type Output: Serialize + Send;

    async fn handle(&self, input: Self::Input) -> Result<Self::Output, HandlerError>;
}

/// Type-erased handler: JSON payload in, tagged outcome out
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn run(&self, payload: Value) -> ExecutionOutcome;
}

struct Typed<H>(H);

#[async_trait]
impl<H: JobHandler> ErasedHandler for Typed<H> {
    async fn run(&self, payload: Value) -> ExecutionOutcome {
        let input = match serde_json::from_value::<H::Input>(payload) {
            Ok(input) => input,
            Err(e) => return ExecutionOutcome::UnrecoverableFailure(format!("Malformed payload: {}", e)),
        };

        match self.0.handle(input).await {
            Ok(output) => match serde_json::to_value(output) {
                Ok(result) => ExecutionOutcome::Succeeded(result),
                Err(e) => ExecutionOutcome::UnrecoverableFailure(format!(
                    "Failed to serialize result: {}",
                    e
                )),
            },
            Err(HandlerError::Recoverable(error)) => ExecutionOutcome::RecoverableFailure(error),
            Err(HandlerError::Unrecoverable(error)) => ExecutionOutcome::UnrecoverableFailure(error),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("Handler name must not be empty")]
    EmptyName,

    #[error("Handler already registered: {0}")]
    Duplicate(String),
}

/// Handlers by name, built once at startup and read-only afterwards
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: JobHandler>(
        &mut self,
        name: impl Into<String>,
        handler: H,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        self.handlers.insert(name, Arc::new(Typed(handler)));
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Sum {
        values: Vec<i64>,
    }

    struct SumHandler;

    #[async_trait]
    impl JobHandler for SumHandler {
        type Input = Sum;
        type Output = i64;

        async fn handle(&self, input: Sum) -> Result<i64, HandlerError> {
            if input.values.is_empty() {
                return Err(HandlerError::Unrecoverable("nothing to add".into()));
            }
            Ok(input.values.iter().sum())
        }
    }

    #[tokio::test]
    async fn test_registry() {
        let mut registry = HandlerRegistry::new();
        registry.register("sum", SumHandler).unwrap();

        assert!(registry.has_handler("sum"));
        assert!(!registry.has_handler("unknown"));
        assert_eq!(registry.names(), vec!["sum".to_string()]);

        let handler = registry.get("sum").unwrap();
        assert_eq!(
            handler.run(json!({"values": [1, 2, 3]})).await,
            ExecutionOutcome::Succeeded(json!(6))
        );
    }

    #[test]
    fn test_duplicate_and_empty_names_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("sum", SumHandler).unwrap();

        assert_eq!(
            registry.register("sum", SumHandler),
            Err(RegistryError::Duplicate("sum".into()))
        );
        assert_eq!(registry.register("  ", SumHandler), Err(RegistryError::EmptyName));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_unrecoverable() {
        let mut registry = HandlerRegistry::new();
        registry.register("sum", SumHandler).unwrap();
        let handler = registry.get("sum").unwrap();

        assert!(matches!(
            handler.run(json!({"values": "many"})).await,
            ExecutionOutcome::UnrecoverableFailure(_)
        ));
        assert_eq!(
            handler.run(json!({"values": []})).await,
            ExecutionOutcome::UnrecoverableFailure("nothing to add".into())
        );
    }
}
