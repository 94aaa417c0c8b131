//! Ties the worker supervisor, item state store, cache, and parameter
//! overrides together behind one coordinator task.
//!
//! Every state mutation happens on that task: worker output is parsed on
//! reader tasks, forwarded as events, and merged in arrival order.

mod cache_io;
pub mod coordinator;
pub mod error;
pub mod worker;

pub use coordinator::{Completion, Coordinator, CoordinatorSettings, SessionStart, SessionView};
pub use error::{CoordinatorError, CoordinatorResult};
pub use worker::{WorkerSettings, ENV_DEBUG, ENV_TEMPLATE_DESCRIPTION_COUNT, ENV_TEMPLATE_PATH};
