//! Domain model (ids, work items, workflows, decisions, errors, events).

pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod item;
pub mod outcome;
pub mod state;
pub mod task_type;
pub mod workflow;

pub use decision::{CompletionReason, Decision, Transition};
pub use errors::{DispatchError, ErrorKind, ExecutionError, StoreError, WorkflowError};
pub use events::{AuditEventType, AuditRecord, StatusEvent};
pub use ids::{ItemId, ParseIdError, WorkerId};
pub use item::{DEFAULT_MAX_TRIES, NewWorkItem, ORCHESTRATOR_OWNER, WorkItem};
pub use outcome::{ExecutionOutput, Usage, UsageTotals};
pub use state::{ItemKind, ItemStatus};
pub use task_type::{TaskType, WORKFLOW_PREFIX};
pub use workflow::{
    COMPLETED_STATE, CoordinationType, StateData, Step, StepOutput, WorkflowDefinition,
    WorkflowState,
};
