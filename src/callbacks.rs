//! Callback chains around leaf execution.
//!
//! Six boundaries: before/after the leaf behavior, before/after each model
//! call, before/after each tool call. Callbacks run synchronously in
//! registration order with mutable access to the shared store. The first
//! non-`Continue` outcome wins: `Substitute` skips the real step (and any
//! later callbacks in that boundary), `Abort` fails the leaf.

use std::sync::Arc;

use serde_json::Value;

use crate::branch::BranchPath;
use crate::collaborators::ModelRequest;
use crate::events::{Event, TerminalKind};
use crate::state::StateStore;

/// What a callback decided.
#[derive(Debug)]
pub enum CallbackOutcome {
    /// Proceed with the real step.
    Continue,
    /// Skip the real step; emit this event in its place.
    Substitute(Event),
    /// Fail the leaf with this message.
    Abort(String),
}

/// Boundary payload: a leaf is about to run.
#[derive(Clone, Debug)]
pub struct LeafStart {
    pub leaf: String,
    pub branch: BranchPath,
}

/// Boundary payload: a leaf finished with this provisional terminal.
/// An after-leaf `Substitute` converts a `Failed` terminal into `Completed`,
/// which is how loop bodies make failures ignorable.
#[derive(Clone, Debug)]
pub struct LeafEnd {
    pub leaf: String,
    pub branch: BranchPath,
    pub terminal: TerminalKind,
}

/// Boundary payload: a model call is about to be made.
#[derive(Clone, Debug)]
pub struct ModelCall {
    pub leaf: String,
    pub request: ModelRequest,
}

/// Boundary payload: a model call produced this event.
#[derive(Clone, Debug)]
pub struct ModelReply {
    pub leaf: String,
    pub event: Event,
}

/// Boundary payload: a tool call is about to be made.
#[derive(Clone, Debug)]
pub struct ToolCall {
    pub leaf: String,
    pub name: String,
    pub args: Value,
}

/// Boundary payload: a tool call produced this event.
#[derive(Clone, Debug)]
pub struct ToolReply {
    pub leaf: String,
    pub event: Event,
}

type Callback<P> = Arc<dyn Fn(&P, &mut StateStore) -> CallbackOutcome + Send + Sync>;

macro_rules! boundary {
    ($register:ident, $run:ident, $field:ident, $payload:ident) => {
        #[must_use]
        pub fn $register<F>(mut self, callback: F) -> Self
        where
            F: Fn(&$payload, &mut StateStore) -> CallbackOutcome + Send + Sync + 'static,
        {
            self.$field.push(Arc::new(callback));
            self
        }

        pub(crate) fn $run(&self, payload: &$payload, store: &mut StateStore) -> CallbackOutcome {
            for callback in &self.$field {
                match callback(payload, store) {
                    CallbackOutcome::Continue => continue,
                    decided => return decided,
                }
            }
            CallbackOutcome::Continue
        }
    };
}

/// Ordered interceptors for one leaf, empty by default.
#[derive(Clone, Default)]
pub struct CallbackChain {
    before_leaf: Vec<Callback<LeafStart>>,
    after_leaf: Vec<Callback<LeafEnd>>,
    before_model: Vec<Callback<ModelCall>>,
    after_model: Vec<Callback<ModelReply>>,
    before_tool: Vec<Callback<ToolCall>>,
    after_tool: Vec<Callback<ToolReply>>,
}

impl CallbackChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.before_leaf.is_empty()
            && self.after_leaf.is_empty()
            && self.before_model.is_empty()
            && self.after_model.is_empty()
            && self.before_tool.is_empty()
            && self.after_tool.is_empty()
    }

    boundary!(on_before_leaf, run_before_leaf, before_leaf, LeafStart);
    boundary!(on_after_leaf, run_after_leaf, after_leaf, LeafEnd);
    boundary!(on_before_model, run_before_model, before_model, ModelCall);
    boundary!(on_after_model, run_after_model, after_model, ModelReply);
    boundary!(on_before_tool, run_before_tool, before_tool, ToolCall);
    boundary!(on_after_tool, run_after_tool, after_tool, ToolReply);
}

impl std::fmt::Debug for CallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackChain")
            .field("before_leaf", &self.before_leaf.len())
            .field("after_leaf", &self.after_leaf.len())
            .field("before_model", &self.before_model.len())
            .field("after_model", &self.after_model.len())
            .field("before_tool", &self.before_tool.len())
            .field("after_tool", &self.after_tool.len())
            .finish()
    }
}
