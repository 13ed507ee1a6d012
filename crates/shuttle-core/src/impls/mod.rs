//! Implementations of the ports.
//!
//! - **SqliteWorkStore**: the work store on SQLite (file or in-memory)
//! - **event sinks**: no-op, tracing and broadcast notification sinks
//! - **executors**: built-in executors behind the `[[executors]]` factories

pub mod event_sinks;
pub mod executors;
pub mod sqlite;

pub use self::event_sinks::{BroadcastEventSink, NoopEventSink, TracingEventSink};
pub use self::executors::{EchoExecutor, FailExecutor, SequenceExecutor, StaticExecutor};
pub use self::sqlite::{DEFAULT_BUSY_TIMEOUT, SqliteWorkStore};
