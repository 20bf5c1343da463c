//! Runner surface and invocation lifecycle.

mod config;
mod invocation;
mod runner;

pub use config::RunnerConfig;
pub use invocation::{
    InMemorySnapshotStore, InvocationSnapshot, InvocationStatus, SnapshotError, SnapshotStore,
};
pub use runner::{InvocationId, InvokeOptions, Runner, RunnerError};
