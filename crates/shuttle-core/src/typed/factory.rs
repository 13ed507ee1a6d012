//! Static name to constructor map used by declarative executor config.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::handler::Executor;
use super::registry::RegistryError;
use crate::config::ExecutorConfig;
use crate::impls::executors::{EchoExecutor, FailExecutor, SequenceExecutor, StaticExecutor};

/// Builds an executor from its `[[executors]]` entry.
pub type FactoryFn = fn(&ExecutorConfig) -> Result<Arc<dyn Executor>, String>;

pub struct ExecutorFactories {
    factories: BTreeMap<&'static str, FactoryFn>,
}

impl ExecutorFactories {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// `echo`, `static`, `sequence` and `fail`.
    pub fn builtin() -> Self {
        let mut factories = Self::empty();
        factories.register("echo", |_| Ok(Arc::new(EchoExecutor) as Arc<dyn Executor>));
        factories.register("static", |entry| {
            StaticExecutor::from_params(&entry.params).map(|e| Arc::new(e) as Arc<dyn Executor>)
        });
        factories.register("sequence", |entry| {
            SequenceExecutor::from_params(&entry.params).map(|e| Arc::new(e) as Arc<dyn Executor>)
        });
        factories.register("fail", |entry| {
            Ok(Arc::new(FailExecutor::from_params(&entry.params)) as Arc<dyn Executor>)
        });
        factories
    }

    /// Add or replace a factory.
    pub fn register(&mut self, name: &'static str, factory: FactoryFn) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn build(&self, entry: &ExecutorConfig) -> Result<Arc<dyn Executor>, RegistryError> {
        let factory =
            self.factories
                .get(entry.factory.as_str())
                .ok_or_else(|| RegistryError::UnknownFactory {
                    name: entry.name.clone(),
                    factory: entry.factory.clone(),
                })?;

        factory(entry).map_err(|reason| RegistryError::FactoryFailed {
            name: entry.name.clone(),
            factory: entry.factory.clone(),
            reason,
        })
    }
}

impl Default for ExecutorFactories {
    fn default() -> Self {
        Self::builtin()
    }
}
