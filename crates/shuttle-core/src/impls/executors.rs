//! Built-in executors available to `[[executors]]` config.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{ExecutionError, ExecutionOutput, Usage};
use crate::typed::Executor;

/// Returns its input unchanged.
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, input: Value) -> Result<ExecutionOutput, ExecutionError> {
        Ok(ExecutionOutput::new(input))
    }
}

fn usage_param(params: &Value) -> Result<Option<Usage>, String> {
    match params.get("usage") {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| format!("invalid usage: {e}")),
    }
}

/// Always returns the configured `output` (and optional `usage`).
pub struct StaticExecutor {
    output: Value,
    usage: Option<Usage>,
}

impl StaticExecutor {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            usage: None,
        }
    }

    pub fn from_params(params: &Value) -> Result<Self, String> {
        let output = params
            .get("output")
            .cloned()
            .ok_or_else(|| "missing 'output' parameter".to_string())?;
        Ok(Self {
            output,
            usage: usage_param(params)?,
        })
    }
}

#[async_trait]
impl Executor for StaticExecutor {
    async fn execute(&self, _input: Value) -> Result<ExecutionOutput, ExecutionError> {
        Ok(ExecutionOutput {
            output: self.output.clone(),
            usage: self.usage.clone(),
        })
    }
}

/// Returns the configured `outputs` one per call, repeating the last one.
pub struct SequenceExecutor {
    outputs: Vec<Value>,
    usage: Option<Usage>,
    calls: AtomicUsize,
}

impl SequenceExecutor {
    pub fn new(outputs: Vec<Value>) -> Self {
        Self {
            outputs,
            usage: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_params(params: &Value) -> Result<Self, String> {
        let outputs = params
            .get("outputs")
            .and_then(Value::as_array)
            .filter(|outputs| !outputs.is_empty())
            .cloned()
            .ok_or_else(|| "'outputs' must be a non-empty array".to_string())?;
        let mut executor = Self::new(outputs);
        executor.usage = usage_param(params)?;
        Ok(executor)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for SequenceExecutor {
    async fn execute(&self, _input: Value) -> Result<ExecutionOutput, ExecutionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let output = self
            .outputs
            .get(n)
            .or_else(|| self.outputs.last())
            .cloned()
            .ok_or_else(|| ExecutionError::new("sequence executor has no outputs"))?;
        Ok(ExecutionOutput {
            output,
            usage: self.usage.clone(),
        })
    }
}

/// Always fails with the configured `message`.
pub struct FailExecutor {
    message: String,
    calls: AtomicUsize,
}

impl FailExecutor {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_params(params: &Value) -> Self {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("executor configured to fail");
        Self::new(message)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for FailExecutor {
    async fn execute(&self, _input: Value) -> Result<ExecutionOutput, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ExecutionError::new(self.message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echo_returns_input() {
        let out = EchoExecutor.execute(json!({"topic": "X"})).await.unwrap();
        assert_eq!(out.output, json!({"topic": "X"}));
        assert!(out.usage.is_none());
    }

    #[tokio::test]
    async fn sequence_repeats_last_output() {
        let executor = SequenceExecutor::new(vec![json!(1), json!(2)]);

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(executor.execute(json!(null)).await.unwrap().output);
        }

        assert_eq!(seen, vec![json!(1), json!(2), json!(2), json!(2)]);
        assert_eq!(executor.calls(), 4);
    }

    #[tokio::test]
    async fn static_params_include_usage() {
        let executor = StaticExecutor::from_params(&json!({
            "output": {"ok": true},
            "usage": {"model_used": "m", "input_tokens": 3, "output_tokens": 2, "total_cost": 0.01}
        }))
        .unwrap();

        let out = executor.execute(json!({})).await.unwrap();
        let usage = out.usage.unwrap();
        assert_eq!(usage.model_used.as_deref(), Some("m"));
        assert_eq!(usage.total_tokens(), 5);
    }

    #[tokio::test]
    async fn fail_uses_message_param() {
        let executor = FailExecutor::from_params(&json!({"message": "model unavailable"}));
        let err = executor.execute(json!({})).await.unwrap_err();
        assert_eq!(err.message, "model unavailable");
        assert_eq!(executor.calls(), 1);
    }

    #[test]
    fn sequence_requires_outputs() {
        assert!(SequenceExecutor::from_params(&json!({"outputs": []})).is_err());
    }
}
