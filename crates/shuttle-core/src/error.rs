use thiserror::Error;

use crate::app::{BuildError, OrchestratorError};
use crate::config::ConfigError;
use crate::domain::{DispatchError, StoreError, WorkflowError};
use crate::typed::RegistryError;

/// Any error surfaced by the crate's top-level entry points.
#[derive(Debug, Error)]
pub enum ShuttleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
