//! AppBuilder - wiring and startup validation.
//!
//! There are no process-wide globals: `main` builds one `App` and hands
//! `Arc<App>` to every loop.

use std::sync::Arc;

use serde_json::Value;

use super::dispatch::Dispatcher;
use super::lease::LeaseManager;
use super::orchestrator::Orchestrator;
use super::registry::WorkflowRegistry;
use super::status::StatusView;
use super::worker_loop::WorkerLoop;
use crate::config::{ExecutorConfig, ShuttleConfig, WorkerSettings};
use crate::domain::{
    ItemId, NewWorkItem, StatusEvent, StoreError, TaskType, WorkItem, WorkerId, WorkflowError,
};
use crate::error::ShuttleError;
use crate::impls::{SqliteWorkStore, TracingEventSink};
use crate::ports::{Clock, EventSink, IdGenerator, SystemClock, UlidGenerator, WorkStore, notify};
use crate::typed::{AgentTask, ExecutorFactories, ExecutorRegistry, Executor, Handler, RegistryError};

/// AppBuilder builds an [`App`].
///
/// # Usage
/// ```ignore
/// let app = AppBuilder::new(store)
///     .workflows(registry)
///     .register::<ResearchInput, _>(Researcher)?
///     .expect_executors(&["researcher"])
///     .build()?;
/// ```
///
/// # Fail-fast
/// `build()` checks that every agent a workflow step names, plus everything
/// passed to `expect_executors`, has a registered executor.
pub struct AppBuilder {
    store: Arc<dyn WorkStore>,
    executors: ExecutorRegistry,
    workflows: WorkflowRegistry,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    settings: WorkerSettings,
    expected_executors: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing executors: {0:?}. These agents are referenced but not registered.")]
    MissingExecutors(Vec<String>),
}

impl AppBuilder {
    pub fn new(store: Arc<dyn WorkStore>) -> Self {
        Self {
            store,
            executors: ExecutorRegistry::new(),
            workflows: WorkflowRegistry::new(),
            events: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
            ids: None,
            settings: WorkerSettings::default(),
            expected_executors: Vec::new(),
        }
    }

    pub fn workflows(mut self, workflows: WorkflowRegistry) -> Self {
        self.workflows = workflows;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to a ULID generator on the builder's clock.
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn register<T: AgentTask, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.executors.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_dyn(
        mut self,
        name: impl Into<String>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, RegistryError> {
        self.executors.register_dyn(name, executor)?;
        Ok(self)
    }

    /// Register `[[executors]]` entries through the factory table.
    pub fn executors_from_config(
        mut self,
        entries: &[ExecutorConfig],
        factories: &ExecutorFactories,
    ) -> Result<Self, RegistryError> {
        self.executors.register_from_config(entries, factories)?;
        Ok(self)
    }

    pub fn expect_executors(mut self, names: &[&str]) -> Self {
        self.expected_executors
            .extend(names.iter().map(|name| name.to_string()));
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        let mut missing: Vec<String> = self
            .workflows
            .agent_types()
            .into_iter()
            .chain(self.expected_executors)
            .filter(|name| !self.executors.contains(name))
            .collect();
        missing.sort();
        missing.dedup();
        if !missing.is_empty() {
            return Err(BuildError::MissingExecutors(missing));
        }

        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&self.clock))) as Arc<dyn IdGenerator>);
        let executors = Arc::new(self.executors);
        let workflows = Arc::new(self.workflows);
        let lease = Arc::new(LeaseManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.events),
            self.settings.lease_duration,
            self.settings.renew_interval,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&executors),
            Arc::clone(&lease),
            Arc::clone(&self.events),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&self.store),
            Arc::clone(&workflows),
            Arc::clone(&ids),
            Arc::clone(&self.clock),
            Arc::clone(&self.events),
            self.settings.default_max_tries,
        ));

        tracing::info!(
            executors = executors.len(),
            workflows = workflows.len(),
            "app built"
        );
        Ok(App {
            store: self.store,
            executors,
            workflows,
            lease,
            dispatcher,
            orchestrator,
            events: self.events,
            ids,
            clock: self.clock,
            settings: self.settings,
        })
    }
}

/// The wired application context.
pub struct App {
    pub store: Arc<dyn WorkStore>,
    pub executors: Arc<ExecutorRegistry>,
    pub workflows: Arc<WorkflowRegistry>,
    pub lease: Arc<LeaseManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub orchestrator: Arc<Orchestrator>,
    pub events: Arc<dyn EventSink>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub settings: WorkerSettings,
}

impl App {
    /// Open the configured database, load workflows and executors.
    pub fn from_config(
        config: &ShuttleConfig,
        factories: &ExecutorFactories,
    ) -> Result<Self, ShuttleError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = SqliteWorkStore::open(
            config.database.path.clone(),
            config.busy_timeout(),
            Arc::clone(&clock),
        )?;
        let workflows = match &config.workflows.path {
            Some(path) => WorkflowRegistry::load(path)?,
            None => WorkflowRegistry::new(),
        };

        let app = AppBuilder::new(Arc::new(store))
            .clock(clock)
            .settings(config.worker_settings())
            .workflows(workflows)
            .executors_from_config(&config.executors, factories)?
            .build()?;
        Ok(app)
    }

    /// Insert a root task. Workflow names and executors must be known.
    pub async fn submit(
        &self,
        type_or_agent: impl Into<TaskType>,
        input: Value,
    ) -> Result<WorkItem, ShuttleError> {
        let item = NewWorkItem::task(type_or_agent, input)
            .with_max_tries(self.settings.default_max_tries);
        self.submit_item(item).await
    }

    pub async fn submit_item(&self, item: NewWorkItem) -> Result<WorkItem, ShuttleError> {
        match item.type_or_agent.workflow_name() {
            Some(name) => {
                self.workflows.get(name)?;
            }
            None if !item.type_or_agent.is_workflow() => {
                self.executors.get(item.type_or_agent.as_str())?;
            }
            None => return Err(WorkflowError::NotFound(String::new()).into()),
        }

        let id = self.ids.generate_item_id();
        let item = self.store.insert_item(id, item).await?;
        tracing::info!(item_id = %id, type_or_agent = %item.type_or_agent, "task submitted");
        notify(self.events.as_ref(), StatusEvent::pending(id)).await;
        Ok(item)
    }

    pub async fn status(&self, id: ItemId) -> Result<Option<StatusView>, StoreError> {
        StatusView::for_task(self.store.as_ref(), id).await
    }

    pub fn worker(self: &Arc<Self>, worker: WorkerId) -> WorkerLoop {
        WorkerLoop::new(Arc::clone(self), worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionError, ExecutionOutput, Step, WorkflowDefinition};
    use crate::impls::EchoExecutor;
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct ResearchInput {
        topic: String,
    }

    impl AgentTask for ResearchInput {
        const AGENT: &'static str = "researcher";
    }

    struct Researcher;

    #[async_trait]
    impl Handler<ResearchInput> for Researcher {
        async fn handle(&self, input: ResearchInput) -> Result<ExecutionOutput, ExecutionError> {
            Ok(ExecutionOutput::new(json!({ "findings": input.topic })))
        }
    }

    fn store() -> Arc<dyn WorkStore> {
        Arc::new(SqliteWorkStore::open_in_memory(Arc::new(SystemClock)).unwrap())
    }

    fn tworesearch() -> WorkflowRegistry {
        WorkflowRegistry::from_definitions([WorkflowDefinition::iterative(
            "tworesearch",
            vec![Step::new("researcher"), Step::new("reviewer")],
            "approved",
            3,
        )])
        .unwrap()
    }

    #[test]
    fn build_succeeds_when_every_step_has_an_executor() {
        let app = AppBuilder::new(store())
            .workflows(tworesearch())
            .register::<ResearchInput, _>(Researcher)
            .unwrap()
            .register_dyn("reviewer", Arc::new(EchoExecutor))
            .unwrap()
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn build_reports_missing_step_executors() {
        let app = AppBuilder::new(store())
            .workflows(tworesearch())
            .register::<ResearchInput, _>(Researcher)
            .unwrap()
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingExecutors(missing)) if missing == vec!["reviewer".to_string()]
        ));
    }

    #[test]
    fn build_reports_missing_expected_executors() {
        let app = AppBuilder::new(store())
            .register::<ResearchInput, _>(Researcher)
            .unwrap()
            .expect_executors(&["researcher", "writer"])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingExecutors(missing)) if missing == vec!["writer".to_string()]
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let result = AppBuilder::new(store())
            .register_dyn("echo", Arc::new(EchoExecutor))
            .unwrap()
            .register_dyn("echo", Arc::new(EchoExecutor));
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn submit_rejects_unknown_targets() {
        let app = AppBuilder::new(store())
            .workflows(tworesearch())
            .register::<ResearchInput, _>(Researcher)
            .unwrap()
            .register_dyn("reviewer", Arc::new(EchoExecutor))
            .unwrap()
            .build()
            .unwrap();

        let ok = app
            .submit(TaskType::workflow("tworesearch"), json!({"topic": "X"}))
            .await
            .unwrap();
        assert_eq!(ok.type_or_agent.as_str(), "workflow:tworesearch");

        assert!(matches!(
            app.submit(TaskType::workflow("nope"), json!({})).await,
            Err(ShuttleError::Workflow(WorkflowError::NotFound(_)))
        ));
        assert!(matches!(
            app.submit("translate", json!({})).await,
            Err(ShuttleError::Registry(RegistryError::UnknownExecutor(_)))
        ));
        assert!(matches!(
            app.submit("workflow:", json!({})).await,
            Err(ShuttleError::Workflow(WorkflowError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn from_config_wires_a_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ShuttleConfig::default();
        config.database.path = dir.path().join("queue.db");
        config.executors = vec![ExecutorConfig::new("echo", "echo")];

        let app = App::from_config(&config, &ExecutorFactories::builtin()).unwrap();
        let item = app.submit("echo", json!({"x": 1})).await.unwrap();

        let status = app.status(item.id).await.unwrap().unwrap();
        assert_eq!(status.status, crate::domain::ItemStatus::Pending);
        assert!(dir.path().join("queue.db").exists());
    }
}
