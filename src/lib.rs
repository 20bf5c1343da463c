//! # branchwork
//!
//! Composable work-unit orchestration: small units of work (a model call, a
//! tool invocation, or a nested sub-workflow) composed into larger control
//! flow with strict sequences, concurrent fan-out, bounded iteration, and
//! custom branching, all sharing one mutable state store and producing a
//! single, ordered, streamable log of events.
//!
//! ## Core pieces
//!
//! - [`units`]: the [`WorkUnit`](units::WorkUnit) shapes, `Leaf`,
//!   `Sequential`, `Parallel`, `Loop`, and `Custom`.
//! - [`state`]: the scoped key/value [`StateStore`](state::StateStore)
//!   (`app:`/`user:` permanent, `temp:` branch-temporary, the rest
//!   invocation-scoped), with fork/journal merges for parallel branches.
//! - [`events`]: the [`Event`](events::Event) record and the
//!   replay-then-follow [`EventStream`](events::EventStream).
//! - [`callbacks`]: interceptor chains around leaf, model, and tool
//!   boundaries.
//! - [`runtime`]: the [`Runner`](runtime::Runner) driving invocations:
//!   submit, stream, resume, cancel.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use branchwork::prelude::*;
//! use rustc_hash::FxHashMap;
//! use serde_json::json;
//!
//! struct Greet;
//!
//! #[async_trait]
//! impl LeafBehavior for Greet {
//!     async fn run(&self, ctx: &mut LeafContext<'_>) -> Result<LeafFinish, UnitError> {
//!         let event = Event::text(ctx.author().to_string(), "hello")
//!             .with_state("greeted", json!(true));
//!         ctx.emit(event);
//!         Ok(LeafFinish::Completed)
//!     }
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let root = Arc::new(Sequential::new(
//!     "pipeline",
//!     vec![Arc::new(Leaf::new("greeter", Greet))],
//! )?);
//!
//! let runner = Runner::default();
//! let id = runner.submit(root, FxHashMap::default());
//! let mut stream = runner.stream(&id)?;
//! while let Some(event) = stream.recv().await {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Every invocation ends with exactly one terminal event
//! ([`TerminalKind`](events::TerminalKind): completed, cancelled, failed,
//! deadline exceeded, or suspended); failures travel as data inside it,
//! never as unwinding.

pub mod branch;
pub mod callbacks;
pub mod collaborators;
pub mod context;
pub mod events;
pub mod runtime;
pub mod state;
pub mod telemetry;
pub mod units;

/// Convenience re-exports for the common surface.
pub mod prelude {
    pub use crate::branch::{BranchPath, BranchSegment};
    pub use crate::callbacks::{CallbackChain, CallbackOutcome};
    pub use crate::collaborators::{
        CallContext, CollaboratorError, ModelInvoker, ModelRequest, ToolInvoker,
    };
    pub use crate::context::{CancelSignal, ExecutionContext};
    pub use crate::events::{
        ChannelSink, Event, EventActions, EventPayload, EventSink, EventStream, FailureDetail,
        MemorySink, TerminalKind,
    };
    pub use crate::runtime::{
        InMemorySnapshotStore, InvocationSnapshot, InvocationStatus, InvokeOptions, Runner,
        RunnerConfig, RunnerError, SnapshotStore,
    };
    pub use crate::state::{KeyScope, StateError, StateStore};
    pub use crate::units::{
        BranchOutcome, ConfigurationError, Custom, CustomContext, CustomRoutine, Leaf,
        LeafBehavior, LeafContext, LeafFinish, Loop, Parallel, Sequential, UnitError, WorkUnit,
    };
}
