//! Work item status and kind.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a work item.
///
/// State transitions:
/// - Pending -> Running (claim) -> Done
/// - Pending -> Running (claim) -> Error (execution failure, budget exhausted)
/// - Pending -> Running -> Pending (lease expired with budget left, via recover)
///
/// A `Running` row whose lease expired is still `Running` until `recover`
/// observes it; that is the recoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be claimed.
    Pending,

    /// Claimed by a worker (or parked under a workflow).
    Running,

    /// Finished successfully.
    Done,

    /// Failed permanently.
    Error,
}

impl ItemStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Done | ItemStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Running => "running",
            ItemStatus::Done => "done",
            ItemStatus::Error => "error",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "running" => Ok(ItemStatus::Running),
            "done" => Ok(ItemStatus::Done),
            "error" => Ok(ItemStatus::Error),
            other => Err(format!("unknown item status '{other}'")),
        }
    }
}

/// Root task or workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Task,
    Subtask,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Task => "task",
            ItemKind::Subtask => "subtask",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(ItemKind::Task),
            "subtask" => Ok(ItemKind::Subtask),
            other => Err(format!("unknown item kind '{other}'")),
        }
    }
}
