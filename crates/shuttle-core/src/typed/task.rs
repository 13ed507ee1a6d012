//! Typed agent input.
//!
//! Ties an agent name to the Rust type its input deserializes into, so a
//! handler never sees raw JSON and a typo in the agent name is a compile
//! error at the registration site.

use serde::de::DeserializeOwned;

/// Input of one agent.
///
/// # Usage
/// ```ignore
/// #[derive(Deserialize)]
/// struct ResearchInput {
///     topic: String,
///     #[serde(default)]
///     feedback: Option<serde_json::Value>,
/// }
///
/// impl AgentTask for ResearchInput {
///     const AGENT: &'static str = "researcher";
/// }
/// ```
///
/// Workflow steps receive the root input plus `previous_output`, `feedback`
/// and `iteration` keys; unknown keys are ignored by serde unless the type
/// opts into `deny_unknown_fields`.
pub trait AgentTask: DeserializeOwned + Send + Sync + 'static {
    /// Name used as `type_or_agent`.
    const AGENT: &'static str;
}
