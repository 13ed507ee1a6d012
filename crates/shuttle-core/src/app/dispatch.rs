//! Executor dispatch: resolve `type_or_agent`, run it under the lease and
//! record the result of plain tasks.
//!
//! Subtask results are not written here; the orchestrator writes them in the
//! same transaction as the workflow transition.

use std::sync::Arc;

use crate::domain::{
    DispatchError, ExecutionOutput, ItemStatus, StatusEvent, StoreError, WorkItem, WorkerId,
};
use crate::ports::{EventSink, WorkStore, notify};
use crate::typed::ExecutorRegistry;

use super::lease::LeaseManager;

pub struct Dispatcher {
    store: Arc<dyn WorkStore>,
    executors: Arc<ExecutorRegistry>,
    lease: Arc<LeaseManager>,
    events: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn WorkStore>,
        executors: Arc<ExecutorRegistry>,
        lease: Arc<LeaseManager>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            executors,
            lease,
            events,
        }
    }

    /// Run the executor for `item`, renewing its lease meanwhile.
    ///
    /// There is no retry here; a failure is returned as is.
    pub async fn run(
        &self,
        item: &WorkItem,
        worker: &WorkerId,
    ) -> Result<ExecutionOutput, DispatchError> {
        let name = item.type_or_agent.as_str();
        let executor = self
            .executors
            .get(name)
            .map_err(|_| DispatchError::UnknownExecutor(name.to_string()))?;

        tracing::debug!(item_id = %item.id, executor = name, "dispatching");
        let result = self
            .lease
            .hold(item.id, worker, executor.execute(item.input.clone()))
            .await?;
        Ok(result?)
    }

    /// Persist the result of a plain task.
    ///
    /// A lost lease writes nothing. Returns the status written, if any.
    pub async fn record(
        &self,
        item: &WorkItem,
        worker: &WorkerId,
        result: Result<ExecutionOutput, DispatchError>,
        retry: bool,
    ) -> Result<Option<ItemStatus>, StoreError> {
        match result {
            Ok(output) => {
                if !self.store.complete_item(item.id, worker, &output).await? {
                    tracing::warn!(item_id = %item.id, "lease lost before completion was written");
                    return Ok(None);
                }
                tracing::info!(item_id = %item.id, "task done");
                notify(self.events.as_ref(), StatusEvent::done(item.id, output.output)).await;
                Ok(Some(ItemStatus::Done))
            }
            Err(DispatchError::LeaseLost(_)) => Ok(None),
            Err(DispatchError::Store(e)) => Err(e),
            Err(e) => {
                let message = e.to_string();
                let status = self.store.fail_item(item.id, worker, &message, retry).await?;
                match status {
                    Some(ItemStatus::Pending) => {
                        tracing::warn!(item_id = %item.id, error = %message, "task failed, will retry");
                        notify(self.events.as_ref(), StatusEvent::pending(item.id)).await;
                    }
                    Some(status) => {
                        tracing::warn!(item_id = %item.id, status = %status, error = %message, "task failed");
                        notify(self.events.as_ref(), StatusEvent::error(item.id, message)).await;
                    }
                    None => {
                        tracing::warn!(item_id = %item.id, "lease lost before failure was written");
                    }
                }
                Ok(status)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionError, ItemId, NewWorkItem};
    use crate::impls::{FailExecutor, NoopEventSink, SqliteWorkStore, StaticExecutor};
    use crate::ports::SystemClock;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Arc<SqliteWorkStore>,
        dispatcher: Dispatcher,
        worker: WorkerId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteWorkStore::open_in_memory(Arc::new(SystemClock)).unwrap());
        let mut executors = ExecutorRegistry::new();
        executors
            .register_dyn("summarize", Arc::new(StaticExecutor::new(json!({"summary": "ok"}))))
            .unwrap();
        executors
            .register_dyn("broken", Arc::new(FailExecutor::new("model unavailable")))
            .unwrap();
        let events: Arc<dyn EventSink> = Arc::new(NoopEventSink);
        let lease = Arc::new(LeaseManager::new(
            store.clone(),
            events.clone(),
            Duration::from_secs(60),
            Duration::from_secs(20),
        ));
        Fixture {
            dispatcher: Dispatcher::new(store.clone(), Arc::new(executors), lease, events),
            store,
            worker: WorkerId::new("w"),
        }
    }

    async fn claimed(f: &Fixture, type_or_agent: &str) -> WorkItem {
        let id = ItemId::from_ulid(ulid::Ulid::new());
        f.store
            .insert_item(id, NewWorkItem::task(type_or_agent, json!({"text": "t"})))
            .await
            .unwrap();
        f.store
            .claim(&f.worker, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn success_is_written_as_done() {
        let f = fixture();
        let item = claimed(&f, "summarize").await;

        let result = f.dispatcher.run(&item, &f.worker).await;
        let status = f.dispatcher.record(&item, &f.worker, result, false).await.unwrap();

        assert_eq!(status, Some(ItemStatus::Done));
        let stored = f.store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.output, Some(json!({"summary": "ok"})));
        assert_eq!(stored.status, ItemStatus::Done);
    }

    #[tokio::test]
    async fn execution_failure_is_terminal_without_retry() {
        let f = fixture();
        let item = claimed(&f, "broken").await;

        let result = f.dispatcher.run(&item, &f.worker).await;
        assert!(matches!(&result, Err(DispatchError::Execution(ExecutionError { message })) if message == "model unavailable"));

        let status = f.dispatcher.record(&item, &f.worker, result, false).await.unwrap();
        assert_eq!(status, Some(ItemStatus::Error));
        let stored = f.store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some("execution failed: model unavailable"));
    }

    #[tokio::test]
    async fn unknown_executor_is_recorded_as_a_failure() {
        let f = fixture();
        let item = claimed(&f, "translate").await;

        let result = f.dispatcher.run(&item, &f.worker).await;
        assert!(matches!(&result, Err(DispatchError::UnknownExecutor(name)) if name == "translate"));

        let status = f.dispatcher.record(&item, &f.worker, result, true).await.unwrap();
        assert_eq!(status, Some(ItemStatus::Pending));
    }
}
