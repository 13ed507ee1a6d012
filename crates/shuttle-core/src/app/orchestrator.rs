//! Orchestrator: the workflow state machine over the work store.
//!
//! Every transition is one `WorkflowCommit`, so the finished subtask, the
//! state update, the next subtask and the root outcome land together or not
//! at all.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use super::coordination::{StepContext, step_input, strategy_for};
use super::registry::WorkflowRegistry;
use crate::domain::{
    AuditEventType, AuditRecord, COMPLETED_STATE, Decision, ExecutionOutput, ItemId, NewWorkItem,
    StateData, StatusEvent, StepOutput, StoreError, Transition, WorkItem, WorkerId,
    WorkflowError, WorkflowState,
};
use crate::ports::{
    Clock, EventSink, IdGenerator, RootOutcome, StateWrite, SubtaskResult, SubtaskWrite,
    WorkStore, WorkflowCommit, WorkflowStart, notify,
};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("work item {0} is not a workflow root")]
    NotAWorkflow(ItemId),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Orchestrator {
    store: Arc<dyn WorkStore>,
    workflows: Arc<WorkflowRegistry>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    subtask_max_tries: u32,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn WorkStore>,
        workflows: Arc<WorkflowRegistry>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        subtask_max_tries: u32,
    ) -> Self {
        Self {
            store,
            workflows,
            ids,
            clock,
            events,
            subtask_max_tries: subtask_max_tries.max(1),
        }
    }

    /// Iteration cap of workflow `name`.
    pub fn max_iterations(&self, name: &str) -> Result<u32, WorkflowError> {
        Ok(self.workflows.get(name)?.max_iterations)
    }

    /// Turn a claimed workflow root into a running workflow: state row at the
    /// first step, iteration 1, plus the first subtask. The root is parked in
    /// the same transaction, so this happens once per root.
    pub async fn create_workflow(
        &self,
        root: &WorkItem,
        worker: &WorkerId,
    ) -> Result<ItemId, OrchestratorError> {
        let name = root
            .workflow_name()
            .ok_or(OrchestratorError::NotAWorkflow(root.id))?;
        let definition = self.workflows.get(name)?;
        let first = definition
            .first_step()
            .ok_or_else(|| WorkflowError::Invalid {
                name: name.to_string(),
                reason: "no steps".to_string(),
            })?;

        let state = WorkflowState {
            parent_task_id: root.id,
            workflow_type: definition.name.clone(),
            current_state: first.name().to_string(),
            current_iteration: 1,
            max_iterations: definition.max_iterations,
            state_data: StateData::new(root.input.clone()),
            updated_at: self.clock.now(),
        };
        let subtask_id = self.ids.generate_item_id();
        let subtask = NewWorkItem::subtask(
            root.id,
            first.agent_type.as_str(),
            1,
            step_input(&root.input, []),
        )
        .with_max_tries(self.subtask_max_tries);

        self.store
            .start_workflow(WorkflowStart {
                root_id: root.id,
                worker: worker.clone(),
                state,
                first_subtask: (subtask_id, subtask),
                audit: vec![
                    AuditRecord::new(
                        AuditEventType::WorkflowCreated,
                        root.id,
                        json!({
                            "workflow": definition.name,
                            "coordination_type": definition.coordination_type.as_str(),
                            "max_iterations": definition.max_iterations,
                        }),
                    ),
                    subtask_created(subtask_id, root.id, first.name(), &first.agent_type, 1),
                ],
            })
            .await?;

        tracing::info!(
            root_id = %root.id,
            workflow = %definition.name,
            subtask_id = %subtask_id,
            step = first.name(),
            "workflow created"
        );
        notify(self.events.as_ref(), StatusEvent::pending(subtask_id)).await;
        Ok(subtask_id)
    }

    /// Record a finished subtask and move its workflow forward.
    ///
    /// The subtask's `done` write is part of the same commit. A missing state,
    /// a completed workflow or a subtask that does not match the expected
    /// step and iteration fails the workflow.
    pub async fn process_subtask_completion(
        &self,
        subtask: &WorkItem,
        worker: &WorkerId,
        result: ExecutionOutput,
    ) -> Result<Decision, StoreError> {
        let root_id = subtask
            .parent_id
            .ok_or_else(|| StoreError::Corrupt(format!("subtask {} has no parent", subtask.id)))?;
        let output = result.output.clone();
        let done = SubtaskWrite {
            id: subtask.id,
            worker: worker.clone(),
            result: SubtaskResult::Done(result),
        };

        let Some(state) = self.store.get_workflow_state(root_id).await? else {
            let reason = format!("workflow state missing for root {root_id}");
            return self.commit_failure(root_id, None, done, &output, reason).await;
        };
        if state.is_completed() {
            let reason = format!("workflow for root {root_id} already completed");
            return self.commit_failure(root_id, None, done, &output, reason).await;
        }

        let definition = match self.workflows.get(&state.workflow_type) {
            Ok(definition) => definition,
            Err(e) => {
                return self
                    .commit_failure(root_id, Some(&state), done, &output, e.to_string())
                    .await;
            }
        };

        let expected = definition
            .step_index(&state.current_state)
            .and_then(|index| definition.steps.get(index).map(|step| (index, step)));
        let step_index = match expected {
            Some((index, step))
                if step.agent_type == subtask.type_or_agent.as_str()
                    && subtask.iteration == state.current_iteration =>
            {
                index
            }
            _ => {
                let reason = format!(
                    "subtask {} ({} @ iteration {}) does not match expected step '{}' @ iteration {}",
                    subtask.id,
                    subtask.type_or_agent,
                    subtask.iteration,
                    state.current_state,
                    state.current_iteration
                );
                return self
                    .commit_failure(root_id, Some(&state), done, &output, reason)
                    .await;
            }
        };

        let mut next = state.clone();
        next.state_data.step_outputs.push(StepOutput {
            step: state.current_state.clone(),
            agent_type: subtask.type_or_agent.to_string(),
            iteration: subtask.iteration,
            subtask_id: subtask.id,
            output: output.clone(),
        });
        next.updated_at = self.clock.now();

        let transition = strategy_for(definition.coordination_type).next(&StepContext {
            definition: &definition,
            state: &next,
            step_index,
            output: &output,
        });

        let mut commit = WorkflowCommit::new(root_id);
        commit.subtask = Some(done);
        commit.audit.push(subtask_completed(subtask, &state.current_state));

        let decision = match transition {
            Transition::Advance {
                step_index,
                iteration,
                input,
            } => match definition.steps.get(step_index) {
                Some(step) => {
                    let next_id = self.ids.generate_item_id();
                    next.current_state = step.name().to_string();
                    next.current_iteration = iteration;
                    commit.next_subtask = Some((
                        next_id,
                        NewWorkItem::subtask(root_id, step.agent_type.as_str(), iteration, input)
                            .with_max_tries(self.subtask_max_tries),
                    ));
                    commit.audit.push(subtask_created(
                        next_id,
                        root_id,
                        step.name(),
                        &step.agent_type,
                        iteration,
                    ));
                    Decision::Continue {
                        subtask_id: next_id,
                        step: step.name().to_string(),
                        iteration,
                    }
                }
                None => fail_in_place(
                    &mut next,
                    &mut commit,
                    format!("step index {step_index} out of range"),
                ),
            },
            Transition::Complete(final_output) => {
                next.current_state = COMPLETED_STATE.to_string();
                commit.root_outcome = Some(RootOutcome::Done(final_output.clone()));
                commit.audit.push(AuditRecord::new(
                    AuditEventType::WorkflowCompleted,
                    root_id,
                    json!({
                        "workflow": definition.name,
                        "iterations": state.current_iteration,
                        "completion_reason": final_output.get("completion_reason"),
                    }),
                ));
                Decision::Complete(final_output)
            }
            Transition::Fail(reason) => fail_in_place(&mut next, &mut commit, reason),
        };

        commit.state = Some(StateWrite {
            expected_state: state.current_state.clone(),
            expected_iteration: state.current_iteration,
            next,
        });
        self.store.commit_workflow(commit).await?;

        tracing::info!(
            root_id = %root_id,
            subtask_id = %subtask.id,
            step = %state.current_state,
            iteration = state.current_iteration,
            decision = decision_label(&decision),
            "subtask processed"
        );
        notify(self.events.as_ref(), StatusEvent::done(subtask.id, output)).await;
        self.notify_decision(root_id, &decision).await;
        Ok(decision)
    }

    /// Fail a workflow after a subtask failed or ran out of retries.
    ///
    /// `failed` carries the subtask's own error write when the caller still
    /// holds its lease; `None` when the subtask is already terminal.
    pub async fn fail_workflow(
        &self,
        root_id: ItemId,
        failed: Option<SubtaskWrite>,
        reason: &str,
    ) -> Result<Decision, StoreError> {
        let state = self.store.get_workflow_state(root_id).await?;
        let failed_id = failed.as_ref().map(|write| write.id);

        let mut commit = WorkflowCommit::new(root_id);
        if let Some(write) = &failed {
            commit.audit.push(AuditRecord::new(
                AuditEventType::SubtaskFailed,
                write.id,
                json!({ "parent_id": root_id.to_string(), "error": reason }),
            ));
        }
        commit.subtask = failed;
        if let Some(state) = state.filter(|s| !s.is_completed()) {
            commit.state = Some(failed_state(&state, reason, self.clock.now()));
        }
        commit.root_outcome = Some(RootOutcome::Error(reason.to_string()));
        commit.audit.push(workflow_failed(root_id, reason));
        self.store.commit_workflow(commit).await?;

        tracing::warn!(root_id = %root_id, reason, "workflow failed");
        if let Some(id) = failed_id {
            notify(self.events.as_ref(), StatusEvent::error(id, reason)).await;
        }
        let decision = Decision::Failed(reason.to_string());
        self.notify_decision(root_id, &decision).await;
        Ok(decision)
    }

    async fn commit_failure(
        &self,
        root_id: ItemId,
        state: Option<&WorkflowState>,
        done: SubtaskWrite,
        output: &serde_json::Value,
        reason: String,
    ) -> Result<Decision, StoreError> {
        let subtask_id = done.id;
        let mut commit = WorkflowCommit::new(root_id);
        commit.subtask = Some(done);
        if let Some(state) = state.filter(|s| !s.is_completed()) {
            commit.state = Some(failed_state(state, &reason, self.clock.now()));
        }
        commit.root_outcome = Some(RootOutcome::Error(reason.clone()));
        commit.audit.push(workflow_failed(root_id, &reason));
        self.store.commit_workflow(commit).await?;

        tracing::error!(root_id = %root_id, subtask_id = %subtask_id, reason = %reason, "workflow failed");
        notify(self.events.as_ref(), StatusEvent::done(subtask_id, output.clone())).await;
        let decision = Decision::Failed(reason);
        self.notify_decision(root_id, &decision).await;
        Ok(decision)
    }

    async fn notify_decision(&self, root_id: ItemId, decision: &Decision) {
        let event = match decision {
            Decision::Continue { subtask_id, .. } => StatusEvent::pending(*subtask_id),
            Decision::Complete(output) => StatusEvent::done(root_id, output.clone()),
            Decision::Failed(reason) => StatusEvent::error(root_id, reason.clone()),
        };
        notify(self.events.as_ref(), event).await;
    }
}

fn fail_in_place(next: &mut WorkflowState, commit: &mut WorkflowCommit, reason: String) -> Decision {
    next.current_state = COMPLETED_STATE.to_string();
    next.state_data.failure = Some(reason.clone());
    commit.root_outcome = Some(RootOutcome::Error(reason.clone()));
    commit.audit.push(workflow_failed(commit.root_id, &reason));
    Decision::Failed(reason)
}

fn failed_state(state: &WorkflowState, reason: &str, now: chrono::DateTime<Utc>) -> StateWrite {
    let mut next = state.clone();
    next.current_state = COMPLETED_STATE.to_string();
    next.state_data.failure = Some(reason.to_string());
    next.updated_at = now;
    StateWrite {
        expected_state: state.current_state.clone(),
        expected_iteration: state.current_iteration,
        next,
    }
}

fn subtask_created(
    subtask_id: ItemId,
    root_id: ItemId,
    step: &str,
    agent_type: &str,
    iteration: u32,
) -> AuditRecord {
    AuditRecord::new(
        AuditEventType::SubtaskCreated,
        subtask_id,
        json!({
            "parent_id": root_id.to_string(),
            "step": step,
            "agent_type": agent_type,
            "iteration": iteration,
        }),
    )
}

fn subtask_completed(subtask: &WorkItem, step: &str) -> AuditRecord {
    AuditRecord::new(
        AuditEventType::SubtaskCompleted,
        subtask.id,
        json!({
            "parent_id": subtask.parent_id.map(|id| id.to_string()),
            "step": step,
            "agent_type": subtask.type_or_agent.as_str(),
            "iteration": subtask.iteration,
        }),
    )
}

fn workflow_failed(root_id: ItemId, reason: &str) -> AuditRecord {
    AuditRecord::new(
        AuditEventType::WorkflowFailed,
        root_id,
        json!({ "error": reason }),
    )
}

fn decision_label(decision: &Decision) -> &'static str {
    match decision {
        Decision::Continue { .. } => "continue",
        Decision::Complete(_) => "complete",
        Decision::Failed(_) => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ItemStatus, Step, WorkflowDefinition};
    use crate::impls::{NoopEventSink, SqliteWorkStore};
    use crate::ports::{SystemClock, UlidGenerator};
    use std::time::Duration;

    const LEASE: Duration = Duration::from_secs(60);

    struct Fixture {
        store: Arc<SqliteWorkStore>,
        orchestrator: Orchestrator,
        worker: WorkerId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteWorkStore::open_in_memory(Arc::new(SystemClock)).unwrap());
        let workflows = WorkflowRegistry::from_definitions([WorkflowDefinition::sequential(
            "pipeline",
            vec![Step::new("researcher"), Step::new("writer")],
        )])
        .unwrap();
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(workflows),
            Arc::new(UlidGenerator::new(SystemClock)),
            Arc::new(SystemClock),
            Arc::new(NoopEventSink),
            3,
        );
        Fixture {
            store,
            orchestrator,
            worker: WorkerId::new("w"),
        }
    }

    async fn claim_root(f: &Fixture, type_or_agent: &str) -> WorkItem {
        let id = ItemId::from_ulid(ulid::Ulid::new());
        f.store
            .insert_item(id, NewWorkItem::task(type_or_agent, json!({"topic": "X"})))
            .await
            .unwrap();
        f.store.claim(&f.worker, LEASE).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn create_workflow_runs_once_per_root() {
        let f = fixture();
        let root = claim_root(&f, "workflow:pipeline").await;

        let first = f.orchestrator.create_workflow(&root, &f.worker).await.unwrap();

        let subtask = f.store.get_item(first).await.unwrap().unwrap();
        assert_eq!(subtask.type_or_agent.as_str(), "researcher");
        assert_eq!(subtask.iteration, 1);
        assert_eq!(subtask.input, json!({"topic": "X"}));
        let state = f.store.get_workflow_state(root.id).await.unwrap().unwrap();
        assert_eq!(state.current_state, "researcher");
        assert_eq!(state.current_iteration, 1);

        let again = f.orchestrator.create_workflow(&root, &f.worker).await;
        assert!(matches!(again, Err(OrchestratorError::Store(StoreError::Conflict(_)))));
    }

    #[tokio::test]
    async fn unknown_workflow_is_reported() {
        let f = fixture();
        let root = claim_root(&f, "workflow:nope").await;

        let err = f.orchestrator.create_workflow(&root, &f.worker).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Workflow(WorkflowError::NotFound(_))));
        assert!(f.store.get_workflow_state(root.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mismatched_agent_fails_the_workflow() {
        let f = fixture();
        let root = claim_root(&f, "workflow:pipeline").await;
        let first = f.orchestrator.create_workflow(&root, &f.worker).await.unwrap();
        let mut subtask = f.store.claim(&f.worker, LEASE).await.unwrap().unwrap();
        assert_eq!(subtask.id, first);
        subtask.type_or_agent = "writer".into();

        let decision = f
            .orchestrator
            .process_subtask_completion(&subtask, &f.worker, ExecutionOutput::new(json!("x")))
            .await
            .unwrap();

        assert!(matches!(decision, Decision::Failed(_)));
        let root = f.store.get_item(root.id).await.unwrap().unwrap();
        assert_eq!(root.status, ItemStatus::Error);
        let done = f.store.get_item(first).await.unwrap().unwrap();
        assert_eq!(done.status, ItemStatus::Done);
        let state = f.store.get_workflow_state(root.id).await.unwrap().unwrap();
        assert!(state.is_completed());
        assert!(state.state_data.failure.is_some());
    }

    #[tokio::test]
    async fn missing_state_fails_the_root() {
        let f = fixture();
        let root = ItemId::from_ulid(ulid::Ulid::new());
        f.store
            .insert_item(root, NewWorkItem::task("workflow:pipeline", json!({})))
            .await
            .unwrap();
        let orphan = ItemId::from_ulid(ulid::Ulid::new());
        f.store
            .insert_item(orphan, NewWorkItem::subtask(root, "researcher", 1, json!({})))
            .await
            .unwrap();
        // subtasks are claimed before roots
        let subtask = f.store.claim(&f.worker, LEASE).await.unwrap().unwrap();
        assert_eq!(subtask.id, orphan);

        let decision = f
            .orchestrator
            .process_subtask_completion(&subtask, &f.worker, ExecutionOutput::new(json!({})))
            .await
            .unwrap();

        assert!(matches!(decision, Decision::Failed(reason) if reason.contains("state missing")));
        let root = f.store.get_item(root).await.unwrap().unwrap();
        assert_eq!(root.status, ItemStatus::Error);
    }

    #[tokio::test]
    async fn fail_workflow_closes_state_and_root() {
        let f = fixture();
        let root = claim_root(&f, "workflow:pipeline").await;
        f.orchestrator.create_workflow(&root, &f.worker).await.unwrap();
        let subtask = f.store.claim(&f.worker, LEASE).await.unwrap().unwrap();

        let write = SubtaskWrite {
            id: subtask.id,
            worker: f.worker.clone(),
            result: SubtaskResult::Error("model unavailable".into()),
        };
        let decision = f
            .orchestrator
            .fail_workflow(root.id, Some(write), "subtask failed: model unavailable")
            .await
            .unwrap();

        assert_eq!(decision, Decision::Failed("subtask failed: model unavailable".into()));
        let subtask = f.store.get_item(subtask.id).await.unwrap().unwrap();
        assert_eq!(subtask.status, ItemStatus::Error);
        let root = f.store.get_item(root.id).await.unwrap().unwrap();
        assert_eq!(root.error.as_deref(), Some("subtask failed: model unavailable"));
        let state = f.store.get_workflow_state(root.id).await.unwrap().unwrap();
        assert_eq!(state.current_state, COMPLETED_STATE);
        assert_eq!(f.orchestrator.max_iterations("pipeline").unwrap(), 1);
    }
}
