//! shuttle-core
//!
//! Durable lease-based work queue and workflow engine on SQLite.
//!
//! # Modules
//! - **domain**: work items, workflows, decisions, errors, events
//! - **ports**: the work store, clock, id generation and notification seams
//! - **app**: lease manager, dispatcher, orchestrator, worker and reaper loops
//! - **typed**: executor trait, typed handlers, executor registry and factories
//! - **impls**: SQLite store, built-in executors, event sinks
//! - **config**: `shuttle.toml`
//! - **observability**: queue counters

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod typed;

pub use app::{App, AppBuilder, WorkerGroup, WorkerLoop};
pub use config::ShuttleConfig;
pub use error::ShuttleError;
