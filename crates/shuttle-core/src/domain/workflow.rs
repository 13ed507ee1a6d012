//! Workflow definitions and persisted workflow state.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::WorkflowError;
use super::ids::ItemId;

/// `current_state` of a finished workflow.
pub const COMPLETED_STATE: &str = "completed";

pub const DEFAULT_PRIMARY_OUTPUT_KEY: &str = "research_findings";

/// How the steps of a workflow are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationType {
    /// Every step runs once, in order.
    Sequential,

    /// Steps form a cycle; the last step evaluates and decides whether to
    /// loop again.
    IterativeRefinement,
}

impl CoordinationType {
    pub fn as_str(self) -> &'static str {
        match self {
            CoordinationType::Sequential => "sequential",
            CoordinationType::IterativeRefinement => "iterative_refinement",
        }
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub agent_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Step {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            name: None,
        }
    }

    pub fn named(agent_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            name: Some(name.into()),
        }
    }

    /// Step name; defaults to the agent type.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.agent_type)
    }
}

fn default_max_iterations() -> u32 {
    3
}

fn default_primary_output_key() -> String {
    DEFAULT_PRIMARY_OUTPUT_KEY.to_string()
}

/// Declarative workflow, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub steps: Vec<Step>,

    pub coordination_type: CoordinationType,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convergence_check: Option<String>,

    /// Key under which step 0's output is handed to step 1 (sequential only).
    #[serde(default = "default_primary_output_key")]
    pub primary_output_key: String,
}

impl WorkflowDefinition {
    pub fn sequential(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps,
            coordination_type: CoordinationType::Sequential,
            max_iterations: 1,
            convergence_check: None,
            primary_output_key: default_primary_output_key(),
        }
    }

    pub fn iterative(
        name: impl Into<String>,
        steps: Vec<Step>,
        convergence_check: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps,
            coordination_type: CoordinationType::IterativeRefinement,
            max_iterations,
            convergence_check: Some(convergence_check.into()),
            primary_output_key: default_primary_output_key(),
        }
    }

    /// Structural checks. Convergence names are resolved by the orchestrator.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let invalid = |reason: &str| WorkflowError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(invalid("at least one step is required"));
        }
        if self.steps.iter().any(|s| s.agent_type.trim().is_empty()) {
            return Err(invalid("step agent_type must not be empty"));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name()) {
                return Err(invalid(&format!("duplicate step name '{}'", step.name())));
            }
        }

        if self.max_iterations == 0 {
            return Err(invalid("max_iterations must be at least 1"));
        }

        match (self.coordination_type, &self.convergence_check) {
            (CoordinationType::IterativeRefinement, None) => {
                Err(invalid("iterative_refinement requires convergence_check"))
            }
            (CoordinationType::Sequential, Some(_)) => {
                Err(invalid("convergence_check is only valid for iterative_refinement"))
            }
            _ => Ok(()),
        }
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name() == name)
    }

    pub fn first_step(&self) -> Option<&Step> {
        self.steps.first()
    }

    pub fn is_last_step(&self, index: usize) -> bool {
        index + 1 == self.steps.len()
    }

    /// Index of the step whose output is the workflow result in iterative mode:
    /// the step right before the evaluator.
    pub fn produce_step_index(&self) -> usize {
        self.steps.len().saturating_sub(2)
    }
}

/// Output of one finished step, kept in `state_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub step: String,
    pub agent_type: String,
    pub iteration: u32,
    pub subtask_id: ItemId,
    pub output: serde_json::Value,
}

/// Accumulated workflow data, persisted as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    /// Root task input.
    pub input: serde_json::Value,

    /// Every step output in completion order, across iterations.
    #[serde(default)]
    pub step_outputs: Vec<StepOutput>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl StateData {
    pub fn new(input: serde_json::Value) -> Self {
        Self {
            input,
            step_outputs: Vec::new(),
            failure: None,
        }
    }

    /// Latest output recorded for `step`.
    pub fn latest_output(&self, step: &str) -> Option<&serde_json::Value> {
        self.step_outputs
            .iter()
            .rev()
            .find(|o| o.step == step)
            .map(|o| &o.output)
    }

    pub fn outputs_for_iteration(&self, iteration: u32) -> impl Iterator<Item = &StepOutput> {
        self.step_outputs
            .iter()
            .filter(move |o| o.iteration == iteration)
    }
}

/// Persisted state machine of one workflow instance (1:1 with its root task).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub parent_task_id: ItemId,
    pub workflow_type: String,

    /// Active step name, or `completed`.
    pub current_state: String,

    pub current_iteration: u32,
    pub max_iterations: u32,
    pub state_data: StateData,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn is_completed(&self) -> bool {
        self.current_state == COMPLETED_STATE
    }
}
