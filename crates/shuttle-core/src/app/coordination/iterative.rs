use serde_json::{Value, json};

use super::{CoordinationStrategy, StepContext, convergence, step_input};
use crate::domain::{COMPLETED_STATE, CompletionReason, Transition};

/// Steps form a cycle; the last step is the evaluator.
///
/// After the evaluator the named convergence check decides between finishing
/// and another iteration. Reaching `max_iterations` finishes with the best
/// result so far.
pub struct IterativeRefinement;

impl CoordinationStrategy for IterativeRefinement {
    fn next(&self, ctx: &StepContext<'_>) -> Transition {
        let def = ctx.definition;
        let state = ctx.state;
        let iteration = state.current_iteration;

        if !def.is_last_step(ctx.step_index) {
            return Transition::Advance {
                step_index: ctx.step_index + 1,
                iteration,
                input: step_input(
                    &state.state_data.input,
                    [("previous_output", ctx.output.clone())],
                ),
            };
        }

        let produced = def
            .steps
            .get(def.produce_step_index())
            .and_then(|step| state.state_data.latest_output(step.name()))
            .cloned()
            .unwrap_or(Value::Null);

        let check = def.convergence_check.as_deref().unwrap_or_default();
        let reason = if convergence::evaluate(check, ctx.output) {
            CompletionReason::Converged
        } else if iteration < state.max_iterations {
            tracing::debug!(
                workflow = %def.name,
                iteration,
                "not converged, starting next iteration"
            );
            return Transition::Advance {
                step_index: 0,
                iteration: iteration + 1,
                input: step_input(
                    &state.state_data.input,
                    [
                        ("feedback", ctx.output.clone()),
                        ("previous_output", produced),
                        ("iteration", json!(iteration + 1)),
                    ],
                ),
            };
        } else {
            CompletionReason::MaxIterations
        };

        Transition::Complete(json!({
            "status": COMPLETED_STATE,
            "completion_reason": reason,
            "iterations": iteration,
            "final_output": produced,
            "final_assessment": ctx.output,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ItemId, StateData, Step, StepOutput, WorkflowDefinition, WorkflowState,
    };
    use chrono::Utc;

    fn refine() -> WorkflowDefinition {
        WorkflowDefinition::iterative(
            "refine",
            vec![Step::new("writer"), Step::new("critic")],
            "approved",
            3,
        )
    }

    fn state(iteration: u32, draft: Value, review: Value) -> WorkflowState {
        let mut data = StateData::new(json!({"topic": "X"}));
        for (step, output) in [("writer", draft), ("critic", review)] {
            data.step_outputs.push(StepOutput {
                step: step.into(),
                agent_type: step.into(),
                iteration,
                subtask_id: ItemId::from_ulid(ulid::Ulid::new()),
                output,
            });
        }
        WorkflowState {
            parent_task_id: ItemId::from_ulid(ulid::Ulid::new()),
            workflow_type: "refine".into(),
            current_state: "critic".into(),
            current_iteration: iteration,
            max_iterations: 3,
            state_data: data,
            updated_at: Utc::now(),
        }
    }

    fn after_critic(iteration: u32, review: Value) -> Transition {
        let def = refine();
        let state = state(iteration, json!({"draft": iteration}), review.clone());
        IterativeRefinement.next(&StepContext {
            definition: &def,
            state: &state,
            step_index: 1,
            output: &review,
        })
    }

    #[test]
    fn producer_output_goes_to_the_evaluator() {
        let def = refine();
        let draft = json!({"draft": 1});
        let state = state(1, draft.clone(), Value::Null);

        let next = IterativeRefinement.next(&StepContext {
            definition: &def,
            state: &state,
            step_index: 0,
            output: &draft,
        });

        assert_eq!(
            next,
            Transition::Advance {
                step_index: 1,
                iteration: 1,
                input: json!({"topic": "X", "previous_output": {"draft": 1}}),
            }
        );
    }

    #[test]
    fn rejection_loops_back_with_feedback() {
        let next = after_critic(1, json!({"approved": false, "notes": "thin"}));

        assert_eq!(
            next,
            Transition::Advance {
                step_index: 0,
                iteration: 2,
                input: json!({
                    "topic": "X",
                    "feedback": {"approved": false, "notes": "thin"},
                    "previous_output": {"draft": 1},
                    "iteration": 2,
                }),
            }
        );
    }

    #[test]
    fn approval_completes_as_converged() {
        let Transition::Complete(out) = after_critic(2, json!({"approved": true})) else {
            panic!("expected completion");
        };

        assert_eq!(out["completion_reason"], "converged");
        assert_eq!(out["iterations"], 2);
        assert_eq!(out["final_output"], json!({"draft": 2}));
        assert_eq!(out["final_assessment"]["approved"], true);
    }

    #[test]
    fn approval_on_the_last_iteration_is_still_converged() {
        let Transition::Complete(out) = after_critic(3, json!({"approved": true})) else {
            panic!("expected completion");
        };

        assert_eq!(out["completion_reason"], "converged");
        assert_eq!(out["iterations"], 3);
    }

    #[test]
    fn cap_completes_with_the_last_draft() {
        let Transition::Complete(out) = after_critic(3, json!({"approved": false})) else {
            panic!("expected completion");
        };

        assert_eq!(out["status"], "completed");
        assert_eq!(out["completion_reason"], "max_iterations");
        assert_eq!(out["final_output"], json!({"draft": 3}));
    }
}
