//! Work item records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ItemId;
use super::outcome::Usage;
use super::state::{ItemKind, ItemStatus};
use super::task_type::TaskType;

/// Lease owner written on a workflow root once its workflow exists.
///
/// A parked root has no lease timeout, so it is never recovered nor
/// reclaimed while its subtasks run.
pub const ORCHESTRATOR_OWNER: &str = "orchestrator";

/// Default attempt budget for new items.
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// A persisted work item (root task or subtask).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub kind: ItemKind,
    pub parent_id: Option<ItemId>,
    pub type_or_agent: TaskType,

    /// Workflow iteration this subtask belongs to (1 for plain tasks).
    pub iteration: u32,

    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub status: ItemStatus,

    pub try_count: u32,
    pub max_tries: u32,

    pub locked_by: Option<String>,
    pub lease_timeout: Option<DateTime<Utc>>,

    /// Executor usage for subtasks; aggregated totals for roots.
    #[serde(default)]
    pub usage: Usage,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Workflow name when this is a workflow root task.
    pub fn workflow_name(&self) -> Option<&str> {
        match self.kind {
            ItemKind::Task => self.type_or_agent.workflow_name(),
            ItemKind::Subtask => None,
        }
    }

    pub fn is_workflow_root(&self) -> bool {
        self.workflow_name().is_some()
    }

    pub fn budget_exhausted(&self) -> bool {
        self.try_count >= self.max_tries
    }
}

/// Insert request for a new item. Ids and timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkItem {
    pub kind: ItemKind,
    pub parent_id: Option<ItemId>,
    pub type_or_agent: TaskType,
    pub iteration: u32,
    pub input: serde_json::Value,
    pub max_tries: u32,
}

impl NewWorkItem {
    /// A root task.
    pub fn task(type_or_agent: impl Into<TaskType>, input: serde_json::Value) -> Self {
        Self {
            kind: ItemKind::Task,
            parent_id: None,
            type_or_agent: type_or_agent.into(),
            iteration: 1,
            input,
            max_tries: DEFAULT_MAX_TRIES,
        }
    }

    /// A workflow step under `parent`.
    pub fn subtask(
        parent: ItemId,
        agent: impl Into<TaskType>,
        iteration: u32,
        input: serde_json::Value,
    ) -> Self {
        Self {
            kind: ItemKind::Subtask,
            parent_id: Some(parent),
            type_or_agent: agent.into(),
            iteration,
            input,
            max_tries: DEFAULT_MAX_TRIES,
        }
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries.max(1);
        self
    }
}
