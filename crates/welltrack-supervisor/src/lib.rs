//! Launches the analysis worker, relays its primary output through the
//! protocol parser, and enforces cancellation, timeouts, and the one
//! invocation per scope rule.

pub mod error;
pub mod invocation;
pub mod registry;
pub mod supervisor;

pub use error::{SupervisorError, SupervisorResult};
pub use invocation::{
    CancelHandle, InvocationMessage, InvocationReport, InvocationRequest, InvocationScope,
    RunningInvocation, WorkerCommand,
};
pub use registry::InflightRegistry;
pub use supervisor::{ProcessSupervisor, SupervisorConfig, DEFAULT_EVENT_BUFFER};
