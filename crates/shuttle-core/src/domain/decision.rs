//! Decision model: what the orchestrator does after a subtask completes.
//!
//! Coordination strategies are pure: given a definition, the current state
//! and the completed step's output they return a [`Transition`]. The
//! orchestrator applies the transition in one store transaction and reports
//! the resulting [`Decision`] to the worker loop.

use serde::{Deserialize, Serialize};

use super::ids::ItemId;

/// Why an iterative workflow stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Converged,
    MaxIterations,
}

/// Next state computed by a coordination strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Create the subtask for `step_index` at `iteration`.
    Advance {
        step_index: usize,
        iteration: u32,
        input: serde_json::Value,
    },

    /// Workflow finished with this aggregated output.
    Complete(serde_json::Value),

    Fail(String),
}

/// Outcome of processing one subtask completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Exactly one new subtask was created.
    Continue {
        subtask_id: ItemId,
        step: String,
        iteration: u32,
    },

    /// Workflow completed; the root task is `done` with this output.
    Complete(serde_json::Value),

    /// Workflow failed; the root task is `error` with this message.
    Failed(String),
}

impl Decision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Decision::Continue { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_reason_serializes_snake_case() {
        let v = serde_json::to_value(CompletionReason::MaxIterations).unwrap();
        assert_eq!(v, serde_json::json!("max_iterations"));
    }

    #[test]
    fn only_continue_is_non_terminal() {
        let cont = Decision::Continue {
            subtask_id: ItemId::from_ulid(ulid::Ulid::new()),
            step: "reviewer".into(),
            iteration: 1,
        };
        assert!(!cont.is_terminal());
        assert!(Decision::Failed("x".into()).is_terminal());
        assert!(Decision::Complete(serde_json::Value::Null).is_terminal());
    }
}
