//! Typed executor API.
//!
//! Two layers:
//! - **typed surface**: `AgentTask` and `Handler<T>`, checked at compile time
//! - **dyn core**: `Executor`, object-safe, stored in the registry
//!
//! Declarative `[[executors]]` config goes through `ExecutorFactories`, a
//! static name to constructor map; there is no runtime type lookup.

pub mod factory;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::factory::{ExecutorFactories, FactoryFn};
pub use self::handler::{Executor, FnExecutor, Handler, TypedHandler};
pub use self::registry::{ExecutorRegistry, RegistryError};
pub use self::task::AgentTask;
