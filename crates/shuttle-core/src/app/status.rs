//! Status queries for submitted tasks.

use serde::Serialize;

use crate::domain::{
    ItemId, ItemKind, ItemStatus, StoreError, TaskType, UsageTotals, WorkflowState,
};
use crate::ports::WorkStore;

/// Where a workflow root currently is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowProgress {
    pub workflow_type: String,
    pub current_state: String,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub completed_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl From<&WorkflowState> for WorkflowProgress {
    fn from(state: &WorkflowState) -> Self {
        Self {
            workflow_type: state.workflow_type.clone(),
            current_state: state.current_state.clone(),
            current_iteration: state.current_iteration,
            max_iterations: state.max_iterations,
            completed_steps: state.state_data.step_outputs.len(),
            failure: state.state_data.failure.clone(),
        }
    }
}

/// Snapshot of one work item, with workflow progress for roots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub id: ItemId,
    pub kind: ItemKind,
    pub type_or_agent: TaskType,
    pub status: ItemStatus,
    pub try_count: u32,
    pub max_tries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub usage: UsageTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowProgress>,
}

impl StatusView {
    pub async fn for_task(store: &dyn WorkStore, id: ItemId) -> Result<Option<Self>, StoreError> {
        let Some(item) = store.get_item(id).await? else {
            return Ok(None);
        };
        let workflow = if item.is_workflow_root() {
            store
                .get_workflow_state(id)
                .await?
                .as_ref()
                .map(WorkflowProgress::from)
        } else {
            None
        };

        Ok(Some(Self {
            id: item.id,
            kind: item.kind,
            status: item.status,
            try_count: item.try_count,
            max_tries: item.max_tries,
            usage: UsageTotals {
                input_tokens: item.usage.input_tokens,
                output_tokens: item.usage.output_tokens,
                total_cost: item.usage.total_cost,
            },
            type_or_agent: item.type_or_agent,
            output: item.output,
            error: item.error,
            workflow,
        }))
    }
}
