//! WorkStore port - the source of truth for work items and workflow state.
//!
//! Every method is one transaction. Writes that depend on a lease are guarded
//! by `status = 'running' AND locked_by = <worker>`, so a worker that lost its
//! lease can never overwrite the new owner's progress.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    AuditRecord, ExecutionOutput, ItemId, ItemKind, ItemStatus, NewWorkItem, StoreError,
    UsageTotals, WorkItem, WorkerId, WorkflowState,
};
use crate::observability::QueueCounts;

/// Error written on items whose lease expired after their last allowed try.
pub const EXHAUSTED_MESSAGE: &str = "max retries exceeded: lease expired on final attempt";

/// Failure reason written on a workflow whose subtask ran out of tries.
pub fn exhausted_reason(subtask: ItemId) -> String {
    format!("subtask {subtask} failed: {EXHAUSTED_MESSAGE}")
}

/// An item that `recover` moved to terminal `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExhaustedItem {
    pub id: ItemId,
    pub kind: ItemKind,
    pub parent_id: Option<ItemId>,
}

/// Result of one recovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverReport {
    /// Items returned to `pending`.
    pub reset: Vec<ItemId>,
    /// Items marked terminal `error`.
    pub exhausted: Vec<ExhaustedItem>,
    /// Workflow roots failed because one of their subtasks was exhausted.
    pub failed_roots: Vec<ItemId>,
}

impl RecoverReport {
    /// Number of expired leases handled.
    pub fn count(&self) -> usize {
        self.reset.len() + self.exhausted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Terminal result of the subtask a commit is about.
#[derive(Debug, Clone, PartialEq)]
pub enum SubtaskResult {
    Done(ExecutionOutput),
    Error(String),
}

/// Lease-guarded write of a subtask's terminal status.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskWrite {
    pub id: ItemId,
    pub worker: WorkerId,
    pub result: SubtaskResult,
}

/// Optimistic update of a workflow state row.
#[derive(Debug, Clone, PartialEq)]
pub struct StateWrite {
    pub expected_state: String,
    pub expected_iteration: u32,
    pub next: WorkflowState,
}

/// Terminal status for a root task.
#[derive(Debug, Clone, PartialEq)]
pub enum RootOutcome {
    Done(serde_json::Value),
    Error(String),
}

/// Everything one orchestrator step changes, applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowCommit {
    pub root_id: ItemId,
    pub subtask: Option<SubtaskWrite>,
    pub state: Option<StateWrite>,
    pub next_subtask: Option<(ItemId, NewWorkItem)>,
    pub root_outcome: Option<RootOutcome>,
    pub audit: Vec<AuditRecord>,
}

impl WorkflowCommit {
    pub fn new(root_id: ItemId) -> Self {
        Self {
            root_id,
            subtask: None,
            state: None,
            next_subtask: None,
            root_outcome: None,
            audit: Vec::new(),
        }
    }
}

/// Atomic workflow creation for a claimed root task.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStart {
    pub root_id: ItemId,
    pub worker: WorkerId,
    pub state: WorkflowState,
    pub first_subtask: (ItemId, NewWorkItem),
    pub audit: Vec<AuditRecord>,
}

#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Insert a new `pending` item.
    async fn insert_item(&self, id: ItemId, item: NewWorkItem) -> Result<WorkItem, StoreError>;

    async fn get_item(&self, id: ItemId) -> Result<Option<WorkItem>, StoreError>;

    /// Subtasks of `parent`, oldest first.
    async fn list_subtasks(&self, parent: ItemId) -> Result<Vec<WorkItem>, StoreError>;

    /// Atomically lease one eligible item: `pending`, budget left, lease unset
    /// or past. Subtasks first, then oldest.
    async fn claim(
        &self,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<Option<WorkItem>, StoreError>;

    /// Extend the lease if `worker` still owns the running item.
    async fn renew(&self, id: ItemId, worker: &WorkerId, lease: Duration)
    -> Result<bool, StoreError>;

    /// Reset or fail every running item whose lease has expired.
    ///
    /// An exhausted subtask fails its workflow in the same transaction: the
    /// state is completed with the failure recorded and the root goes to
    /// `error` with [`exhausted_reason`].
    async fn recover(&self) -> Result<RecoverReport, StoreError>;

    /// Record success for a leased item. Returns false if the lease was lost.
    async fn complete_item(
        &self,
        id: ItemId,
        worker: &WorkerId,
        output: &ExecutionOutput,
    ) -> Result<bool, StoreError>;

    /// Record failure for a leased item.
    ///
    /// With `retry` and budget left the item goes back to `pending`; otherwise
    /// it becomes `error`. Returns the new status, or `None` if the lease was
    /// lost.
    async fn fail_item(
        &self,
        id: ItemId,
        worker: &WorkerId,
        error: &str,
        retry: bool,
    ) -> Result<Option<ItemStatus>, StoreError>;

    /// Create the workflow state and first subtask and park the root.
    ///
    /// Fails with `Conflict` if the root is no longer owned by the worker or
    /// a state row already exists.
    async fn start_workflow(&self, start: WorkflowStart) -> Result<(), StoreError>;

    /// Apply one orchestrator step. Fails with `Conflict` (and writes nothing)
    /// if a guard does not hold.
    async fn commit_workflow(&self, commit: WorkflowCommit) -> Result<(), StoreError>;

    async fn get_workflow_state(&self, root: ItemId) -> Result<Option<WorkflowState>, StoreError>;

    /// Sum subtask usage onto the root row and return the totals.
    async fn aggregate_usage(&self, root: ItemId) -> Result<UsageTotals, StoreError>;

    async fn counts_by_status(&self) -> Result<QueueCounts, StoreError>;

    /// Audit rows for one item, oldest first.
    async fn audit_log(&self, item: ItemId) -> Result<Vec<AuditRecord>, StoreError>;
}
