//! Coordination strategies.
//!
//! A strategy is pure: it reads the definition, the workflow state (with the
//! just-finished step already recorded in `state_data`) and returns the next
//! [`Transition`]. The orchestrator owns every side effect.

pub mod convergence;
mod iterative;
mod sequential;

use serde_json::{Map, Value};

use crate::domain::{CoordinationType, Transition, WorkflowDefinition, WorkflowState};

pub use self::iterative::IterativeRefinement;
pub use self::sequential::Sequential;

/// Input to a strategy after a step finished.
pub struct StepContext<'a> {
    pub definition: &'a WorkflowDefinition,
    /// State including the finished step's output.
    pub state: &'a WorkflowState,
    pub step_index: usize,
    pub output: &'a Value,
}

pub trait CoordinationStrategy: Send + Sync {
    fn next(&self, ctx: &StepContext<'_>) -> Transition;
}

pub fn strategy_for(coordination: CoordinationType) -> &'static dyn CoordinationStrategy {
    match coordination {
        CoordinationType::Sequential => &Sequential,
        CoordinationType::IterativeRefinement => &IterativeRefinement,
    }
}

/// Subtask input: the root input plus `extra` fields.
///
/// A non-object root input is kept under `input`.
pub fn step_input<'a>(root_input: &Value, extra: impl IntoIterator<Item = (&'a str, Value)>) -> Value {
    let mut fields = match root_input {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other.clone());
            map
        }
    };
    for (key, value) in extra {
        fields.insert(key.to_string(), value);
    }
    Value::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_input_is_extended() {
        let input = step_input(&json!({"topic": "X"}), [("previous_output", json!({"f": 1}))]);
        assert_eq!(input, json!({"topic": "X", "previous_output": {"f": 1}}));
    }

    #[test]
    fn scalar_input_is_wrapped() {
        assert_eq!(step_input(&json!("X"), []), json!({"input": "X"}));
        assert_eq!(step_input(&Value::Null, []), json!({}));
    }
}
