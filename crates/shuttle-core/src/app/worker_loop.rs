//! WorkerLoop: claim -> dispatch -> decide, with idle backoff.
//!
//! # Flow
//! 1. `LeaseManager::claim` leases one item (subtasks first)
//! 2. workflow root: `Orchestrator::create_workflow`
//! 3. subtask: `Dispatcher::run`, then `Orchestrator::process_subtask_completion`
//! 4. plain task: `Dispatcher::run`, then `Dispatcher::record`
//!
//! Loops in one process share nothing but the store.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::builder::App;
use super::cost;
use super::orchestrator::OrchestratorError;
use super::reaper_loop::ReaperLoop;
use crate::domain::{
    DispatchError, ItemKind, ItemStatus, StatusEvent, StoreError, WorkItem, WorkerId,
};
use crate::ports::{SubtaskResult, SubtaskWrite, notify};

pub struct WorkerLoop {
    app: Arc<App>,
    worker: WorkerId,
}

impl WorkerLoop {
    pub fn new(app: Arc<App>, worker: WorkerId) -> Self {
        Self { app, worker }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker
    }

    /// Run until shutdown is requested. An in-flight item is finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %self.worker, "worker loop started");
        let mut empty_polls: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(true) => {
                    empty_polls = 0;
                    continue;
                }
                Ok(false) => {
                    empty_polls = empty_polls.saturating_add(1);
                    self.app.settings.poll.next_delay(empty_polls)
                }
                Err(e) => {
                    tracing::error!(worker = %self.worker, error = %e, "worker iteration failed");
                    empty_polls = empty_polls.saturating_add(1);
                    self.app.settings.poll.next_delay(empty_polls)
                }
            };

            tracing::debug!(
                worker = %self.worker,
                delay_ms = delay.as_millis() as u64,
                "no work, backing off"
            );
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(worker = %self.worker, "worker loop stopped");
    }

    /// Claim and fully process at most one item. Returns false when nothing
    /// was claimable.
    pub async fn run_once(&self) -> Result<bool, StoreError> {
        let Some(item) = self.app.lease.claim(&self.worker).await? else {
            return Ok(false);
        };
        match item.kind {
            ItemKind::Task if item.is_workflow_root() => self.start_workflow(&item).await?,
            ItemKind::Task => self.run_task(&item).await?,
            ItemKind::Subtask => self.run_subtask(&item).await?,
        }
        Ok(true)
    }

    async fn start_workflow(&self, root: &WorkItem) -> Result<(), StoreError> {
        match self.app.orchestrator.create_workflow(root, &self.worker).await {
            Ok(_) => Ok(()),
            Err(OrchestratorError::Store(StoreError::Conflict(reason))) => {
                tracing::warn!(root_id = %root.id, reason = %reason, "workflow start rejected");
                Ok(())
            }
            Err(OrchestratorError::Store(e)) => Err(e),
            Err(e) => {
                let message = e.to_string();
                tracing::error!(root_id = %root.id, error = %message, "cannot start workflow");
                self.fail_without_retry(root, &message).await
            }
        }
    }

    async fn run_task(&self, item: &WorkItem) -> Result<(), StoreError> {
        let result = self.app.dispatcher.run(item, &self.worker).await;
        self.app
            .dispatcher
            .record(item, &self.worker, result, self.app.settings.retry_failed_executions)
            .await?;
        Ok(())
    }

    async fn run_subtask(&self, item: &WorkItem) -> Result<(), StoreError> {
        let Some(root_id) = item.parent_id else {
            return self.fail_without_retry(item, "subtask has no parent").await;
        };

        let error = match self.app.dispatcher.run(item, &self.worker).await {
            Ok(output) => {
                let has_usage = output.usage.is_some();
                match self
                    .app
                    .orchestrator
                    .process_subtask_completion(item, &self.worker, output)
                    .await
                {
                    Ok(decision) if decision.is_terminal() => {
                        tracing::info!(root_id = %root_id, "workflow finished");
                    }
                    Ok(_) => {}
                    Err(StoreError::Conflict(reason)) => {
                        tracing::warn!(subtask_id = %item.id, reason = %reason, "workflow commit rejected");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
                if has_usage {
                    cost::aggregate_usage(self.app.store.as_ref(), root_id).await;
                }
                return Ok(());
            }
            Err(DispatchError::LeaseLost(_)) => return Ok(()),
            Err(DispatchError::Store(e)) => return Err(e),
            Err(e) => e,
        };

        if self.app.settings.retry_failed_executions && !item.budget_exhausted() {
            self.app
                .dispatcher
                .record(item, &self.worker, Err(error), true)
                .await?;
            return Ok(());
        }

        let message = error.to_string();
        let reason = format!(
            "subtask {} ({}) failed: {message}",
            item.id, item.type_or_agent
        );
        let write = SubtaskWrite {
            id: item.id,
            worker: self.worker.clone(),
            result: SubtaskResult::Error(message),
        };
        match self
            .app
            .orchestrator
            .fail_workflow(root_id, Some(write), &reason)
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict(conflict)) => {
                tracing::warn!(subtask_id = %item.id, reason = %conflict, "workflow failure rejected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fail_without_retry(&self, item: &WorkItem, message: &str) -> Result<(), StoreError> {
        let status = self
            .app
            .store
            .fail_item(item.id, &self.worker, message, false)
            .await?;
        if status.is_some_and(ItemStatus::is_terminal) {
            notify(self.app.events.as_ref(), StatusEvent::error(item.id, message)).await;
        }
        Ok(())
    }
}

/// Worker group handle.
/// - `request_shutdown` stops every loop from taking new leases
/// - `shutdown_and_join` also waits for in-flight items to finish
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` worker loops plus one recovery loop.
    ///
    /// Loop ids are `base` for a single worker and `base-<i>` otherwise.
    pub fn spawn(app: Arc<App>, base: &WorkerId, n: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let n = n.max(1);

        let mut joins = Vec::with_capacity(n + 1);
        for index in 0..n {
            let worker = if n == 1 {
                base.clone()
            } else {
                WorkerId::new(format!("{base}-{index}"))
            };
            let worker_loop = WorkerLoop::new(Arc::clone(&app), worker);
            tracing::debug!(worker = %worker_loop.worker_id(), "spawning worker loop");
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(worker_loop.run(rx)));
        }

        let reaper = ReaperLoop::new(Arc::clone(&app));
        joins.push(tokio::spawn(reaper.run(shutdown_rx)));

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
    }
}
