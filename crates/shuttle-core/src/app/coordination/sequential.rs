use serde_json::{Value, json};

use super::{CoordinationStrategy, StepContext, step_input};
use crate::domain::{COMPLETED_STATE, Transition};

/// Each step runs once, in order; the last output is the result.
pub struct Sequential;

impl CoordinationStrategy for Sequential {
    fn next(&self, ctx: &StepContext<'_>) -> Transition {
        let def = ctx.definition;
        let state = ctx.state;

        if !def.is_last_step(ctx.step_index) {
            let mut extra = vec![("previous_output", ctx.output.clone())];
            if ctx.step_index == 0 {
                extra.push((def.primary_output_key.as_str(), ctx.output.clone()));
            }
            return Transition::Advance {
                step_index: ctx.step_index + 1,
                iteration: state.current_iteration,
                input: step_input(&state.state_data.input, extra),
            };
        }

        let step_outputs: Vec<Value> = state
            .state_data
            .outputs_for_iteration(state.current_iteration)
            .map(|o| o.output.clone())
            .collect();

        Transition::Complete(json!({
            "status": COMPLETED_STATE,
            "step_outputs": step_outputs,
            "final_output": ctx.output,
        }))
    }
}
