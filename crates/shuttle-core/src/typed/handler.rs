//! Executors: the single capability the queue dispatches to.
//!
//! - `Executor` is object-safe and works on raw JSON; the registry stores
//!   `Arc<dyn Executor>`.
//! - `Handler<T>` is the typed surface; `TypedHandler<T, H>` erases it into
//!   an `Executor`.

use async_trait::async_trait;
use std::marker::PhantomData;

use super::task::AgentTask;
use crate::domain::{ExecutionError, ExecutionOutput};

/// Runs one unit of work. Must be safe to re-run: delivery is at-least-once.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, input: serde_json::Value) -> Result<ExecutionOutput, ExecutionError>;
}

/// Typed executor for agent input `T`.
#[async_trait]
pub trait Handler<T: AgentTask>: Send + Sync {
    async fn handle(&self, input: T) -> Result<ExecutionOutput, ExecutionError>;
}

pub struct TypedHandler<T: AgentTask, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: AgentTask, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: AgentTask, H: Handler<T>> Executor for TypedHandler<T, H> {
    async fn execute(&self, input: serde_json::Value) -> Result<ExecutionOutput, ExecutionError> {
        let input: T = serde_json::from_value(input)
            .map_err(|e| ExecutionError::new(format!("invalid input for {}: {e}", T::AGENT)))?;
        self.handler.handle(input).await
    }
}

/// Adapts an async closure into an `Executor`.
pub struct FnExecutor<F>(F);

impl<F, Fut> FnExecutor<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<ExecutionOutput, ExecutionError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<ExecutionOutput, ExecutionError>> + Send,
{
    async fn execute(&self, input: serde_json::Value) -> Result<ExecutionOutput, ExecutionError> {
        (self.0)(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Shout {
        text: String,
    }

    impl AgentTask for Shout {
        const AGENT: &'static str = "shout";
    }

    struct ShoutHandler;

    #[async_trait]
    impl Handler<Shout> for ShoutHandler {
        async fn handle(&self, input: Shout) -> Result<ExecutionOutput, ExecutionError> {
            Ok(ExecutionOutput::new(json!({ "text": input.text.to_uppercase() })))
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_input() {
        let executor = TypedHandler::<Shout, _>::new(ShoutHandler);

        let out = executor
            .execute(json!({ "text": "hi", "previous_output": null }))
            .await
            .unwrap();

        assert_eq!(out.output, json!({ "text": "HI" }));
    }

    #[tokio::test]
    async fn typed_handler_rejects_bad_input() {
        let executor = TypedHandler::<Shout, _>::new(ShoutHandler);

        let err = executor.execute(json!({ "nope": 1 })).await.unwrap_err();

        assert!(err.message.starts_with("invalid input for shout"));
    }

    #[tokio::test]
    async fn fn_executor_runs_closure() {
        let executor = FnExecutor::new(|input: serde_json::Value| async move {
            Ok(ExecutionOutput::new(json!({ "seen": input })))
        });

        let out = executor.execute(json!(7)).await.unwrap();
        assert_eq!(out.output, json!({ "seen": 7 }));
    }
}
