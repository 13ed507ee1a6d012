//! Named convergence checks for iterative workflows.
//!
//! A static name to predicate table; workflow definitions refer to checks by
//! name.

use serde_json::Value;

pub type ConvergenceFn = fn(&Value) -> bool;

/// Threshold used by `score_threshold` when the output carries none.
pub const DEFAULT_SCORE_THRESHOLD: f64 = 0.8;

const CHECKS: &[(&str, ConvergenceFn)] = &[
    ("always", always),
    ("approved", approved),
    ("no_issues", no_issues),
    ("score_threshold", score_threshold),
];

fn always(_output: &Value) -> bool {
    true
}

/// `output.approved == true`.
fn approved(output: &Value) -> bool {
    output.get("approved").and_then(Value::as_bool) == Some(true)
}

/// `output.issues` missing or an empty array.
fn no_issues(output: &Value) -> bool {
    match output.get("issues") {
        None | Some(Value::Null) => true,
        Some(Value::Array(issues)) => issues.is_empty(),
        Some(_) => false,
    }
}

/// `output.score >= output.threshold`.
fn score_threshold(output: &Value) -> bool {
    let Some(score) = output.get("score").and_then(Value::as_f64) else {
        return false;
    };
    let threshold = output
        .get("threshold")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_SCORE_THRESHOLD);
    score >= threshold
}

pub fn lookup(name: &str) -> Option<ConvergenceFn> {
    CHECKS.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
}

pub fn is_known(name: &str) -> bool {
    lookup(name).is_some()
}

pub fn known_names() -> Vec<&'static str> {
    CHECKS.iter().map(|(n, _)| *n).collect()
}

/// Evaluate check `name` against `output`. Unknown names never converge.
pub fn evaluate(name: &str, output: &Value) -> bool {
    match lookup(name) {
        Some(check) => check(output),
        None => {
            tracing::warn!(check = name, "unknown convergence check, treating as not converged");
            false
        }
    }
}
