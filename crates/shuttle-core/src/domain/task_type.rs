//! `type_or_agent` naming convention.
//!
//! A root task whose type is `workflow:<name>` is a workflow root; every other
//! value names an executor (agent or tool) directly.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const WORKFLOW_PREFIX: &str = "workflow:";

/// Executor or workflow selector carried by every work item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// `workflow:<name>` for the given workflow name.
    pub fn workflow(name: &str) -> Self {
        Self(format!("{WORKFLOW_PREFIX}{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The workflow name, if this is a workflow root type.
    pub fn workflow_name(&self) -> Option<&str> {
        self.0
            .strip_prefix(WORKFLOW_PREFIX)
            .filter(|name| !name.is_empty())
    }

    pub fn is_workflow(&self) -> bool {
        self.workflow_name().is_some()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("workflow:tworesearch", Some("tworesearch"))]
    #[case("workflow:", None)]
    #[case("researcher", None)]
    #[case("workflowish", None)]
    fn extracts_workflow_name(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(TaskType::new(raw).workflow_name(), expected);
    }

    #[test]
    fn workflow_constructor_adds_prefix() {
        let t = TaskType::workflow("tworesearch");
        assert_eq!(t.as_str(), "workflow:tworesearch");
        assert!(t.is_workflow());
    }
}
