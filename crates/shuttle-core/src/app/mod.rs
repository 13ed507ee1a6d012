//! App - the application layer, composing the ports.
//!
//! # Components
//! - **AppBuilder / App**: wiring and startup validation
//! - **LeaseManager**: claim, renew, recover
//! - **Dispatcher**: executor resolution and plain task results
//! - **Orchestrator**: workflow state machine over the store
//! - **WorkflowRegistry**: read-only workflow definitions
//! - **WorkerLoop / WorkerGroup**: claim -> dispatch -> decide
//! - **ReaperLoop**: periodic recovery of expired leases
//! - **StatusView**: status of a submitted task

pub mod backoff;
pub mod builder;
pub mod coordination;
pub mod cost;
pub mod dispatch;
pub mod lease;
pub mod orchestrator;
pub mod reaper_loop;
pub mod registry;
pub mod status;
pub mod worker_loop;

pub use self::backoff::PollBackoff;
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::dispatch::Dispatcher;
pub use self::lease::LeaseManager;
pub use self::orchestrator::{Orchestrator, OrchestratorError};
pub use self::reaper_loop::ReaperLoop;
pub use self::registry::WorkflowRegistry;
pub use self::status::{StatusView, WorkflowProgress};
pub use self::worker_loop::{WorkerGroup, WorkerLoop};
