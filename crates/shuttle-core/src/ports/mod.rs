//! Ports - the abstraction layer.
//!
//! Each trait is the interface to something outside the core (the database,
//! the notification channel, time, id minting).
//!
//! - The work store is the single source of truth; there is no in-memory
//!   coordinator and no authoritative cache.
//! - Executors are not a port here: they live in `typed` next to their
//!   registry.

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod work_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, SinkError, notify};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::work_store::{
    EXHAUSTED_MESSAGE, ExhaustedItem, RecoverReport, RootOutcome, StateWrite, SubtaskResult,
    SubtaskWrite, WorkStore, WorkflowCommit, WorkflowStart, exhausted_reason,
};
