//! Status notifications and audit records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::ItemId;
use super::state::ItemStatus;

/// Emitted after every work item status change and every terminal root
/// decision. Delivery is best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub item_id: ItemId,
    pub status: ItemStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    pub fn running(item_id: ItemId) -> Self {
        Self {
            item_id,
            status: ItemStatus::Running,
            output: None,
            error: None,
        }
    }

    pub fn done(item_id: ItemId, output: serde_json::Value) -> Self {
        Self {
            item_id,
            status: ItemStatus::Done,
            output: Some(output),
            error: None,
        }
    }

    pub fn error(item_id: ItemId, error: impl Into<String>) -> Self {
        Self {
            item_id,
            status: ItemStatus::Error,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn pending(item_id: ItemId) -> Self {
        Self {
            item_id,
            status: ItemStatus::Pending,
            output: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    WorkflowCreated,
    SubtaskCreated,
    SubtaskCompleted,
    SubtaskFailed,
    WorkflowCompleted,
    WorkflowFailed,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEventType::WorkflowCreated => "workflow_created",
            AuditEventType::SubtaskCreated => "subtask_created",
            AuditEventType::SubtaskCompleted => "subtask_completed",
            AuditEventType::SubtaskFailed => "subtask_failed",
            AuditEventType::WorkflowCompleted => "workflow_completed",
            AuditEventType::WorkflowFailed => "workflow_failed",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            AuditEventType::WorkflowCreated,
            AuditEventType::SubtaskCreated,
            AuditEventType::SubtaskCompleted,
            AuditEventType::SubtaskFailed,
            AuditEventType::WorkflowCompleted,
            AuditEventType::WorkflowFailed,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
        .ok_or_else(|| format!("unknown audit event type '{s}'"))
    }
}

/// One audit log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_type: AuditEventType,
    pub item_id: ItemId,
    pub metadata: serde_json::Value,
}

impl AuditRecord {
    pub fn new(event_type: AuditEventType, item_id: ItemId, metadata: serde_json::Value) -> Self {
        Self {
            event_type,
            item_id,
            metadata,
        }
    }
}
