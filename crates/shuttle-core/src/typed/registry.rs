//! ExecutorRegistry - name to executor map.
//!
//! Built once at startup (mutable), then shared read-only through `Arc`
//! without locking.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::factory::ExecutorFactories;
use super::handler::{Executor, Handler, TypedHandler};
use super::task::AgentTask;
use crate::config::ExecutorConfig;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("executor '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("unknown executor '{0}'")]
    UnknownExecutor(String),

    #[error("unknown executor factory '{factory}' for executor '{name}'")]
    UnknownFactory { name: String, factory: String },

    #[error("executor factory '{factory}' failed for '{name}': {reason}")]
    FactoryFailed {
        name: String,
        factory: String,
        reason: String,
    },
}

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: BTreeMap::new(),
        }
    }

    /// Register a typed handler under `T::AGENT`.
    pub fn register<T: AgentTask, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(T::AGENT, Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn register_dyn(
        &mut self,
        name: impl Into<String>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.executors.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.executors.insert(name, executor);
        Ok(())
    }

    /// Build and register every `[[executors]]` entry through `factories`.
    pub fn register_from_config(
        &mut self,
        entries: &[ExecutorConfig],
        factories: &ExecutorFactories,
    ) -> Result<(), RegistryError> {
        for entry in entries {
            let executor = factories.build(entry)?;
            self.register_dyn(entry.name.clone(), executor)?;
            tracing::debug!(executor = %entry.name, factory = %entry.factory, "registered executor");
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Executor>, RegistryError> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownExecutor(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        self.executors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionError, ExecutionOutput};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Research {
        topic: String,
    }

    impl AgentTask for Research {
        const AGENT: &'static str = "researcher";
    }

    #[derive(Deserialize)]
    struct Review {}

    impl AgentTask for Review {
        const AGENT: &'static str = "reviewer";
    }

    struct Researcher;

    #[async_trait]
    impl Handler<Research> for Researcher {
        async fn handle(&self, input: Research) -> Result<ExecutionOutput, ExecutionError> {
            Ok(ExecutionOutput::new(json!({ "findings": input.topic })))
        }
    }

    struct Reviewer;

    #[async_trait]
    impl Handler<Review> for Reviewer {
        async fn handle(&self, _input: Review) -> Result<ExecutionOutput, ExecutionError> {
            Ok(ExecutionOutput::new(json!({ "approved": true })))
        }
    }

    #[tokio::test]
    async fn register_and_get() {
        let mut registry = ExecutorRegistry::new();
        registry.register::<Research, _>(Researcher).unwrap();

        let executor = registry.get("researcher").unwrap();
        let out = executor.execute(json!({ "topic": "X" })).await.unwrap();

        assert_eq!(out.output, json!({ "findings": "X" }));
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = ExecutorRegistry::new();
        registry.register::<Research, _>(Researcher).unwrap();

        let result = registry.register::<Research, _>(Researcher);

        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(name)) if name == "researcher"));
    }

    #[test]
    fn unknown_name_fails_lookup() {
        let registry = ExecutorRegistry::new();
        assert!(matches!(
            registry.get("ghost"),
            Err(RegistryError::UnknownExecutor(name)) if name == "ghost"
        ));
    }

    #[test]
    fn registered_names_are_sorted() {
        let mut registry = ExecutorRegistry::new();
        registry.register::<Review, _>(Reviewer).unwrap();
        registry.register::<Research, _>(Researcher).unwrap();

        assert_eq!(registry.registered_names(), vec!["researcher", "reviewer"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn config_entries_go_through_factories() {
        let entries = vec![
            ExecutorConfig::new("echo", "echo"),
            ExecutorConfig::new("mystery", "does-not-exist"),
        ];
        let mut registry = ExecutorRegistry::new();

        let result = registry.register_from_config(&entries, &ExecutorFactories::builtin());

        assert!(matches!(result, Err(RegistryError::UnknownFactory { .. })));
        assert!(registry.contains("echo"));
    }
}
