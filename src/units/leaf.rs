//! Leaf units: a single behavior wrapped in callback boundaries.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::instrument;

use crate::branch::BranchPath;
use crate::callbacks::{
    CallbackChain, CallbackOutcome, LeafEnd, LeafStart, ModelCall, ModelReply, ToolCall, ToolReply,
};
use crate::collaborators::{CallContext, CollaboratorError, ModelInvoker, ModelRequest, ToolInvoker};
use crate::context::ExecutionContext;
use crate::events::{Event, TerminalKind};
use crate::state::StateError;

use super::{failed, BranchOutcome, UnitError, WorkUnit};

/// How a leaf behavior finished.
#[derive(Clone, Debug)]
pub enum LeafFinish {
    Completed,
    /// Park the invocation until `Runner::resume` supplies a payload for
    /// this correlation id. The behavior re-runs on resume and reads the
    /// payload via [`LeafContext::resume_payload`].
    Suspended { correlation_id: String },
}

/// The work a [`Leaf`] performs.
///
/// Behaviors publish output and state mutations by emitting events through
/// the [`LeafContext`], and may call the leaf's model/tool collaborators.
/// Errors become a `Failed` branch outcome; they never unwind the caller.
#[async_trait]
pub trait LeafBehavior: Send + Sync {
    async fn run(&self, ctx: &mut LeafContext<'_>) -> Result<LeafFinish, UnitError>;
}

/// Smallest unit of work: one behavior, optional collaborators, callbacks.
pub struct Leaf {
    name: String,
    behavior: Arc<dyn LeafBehavior>,
    model: Option<Arc<dyn ModelInvoker>>,
    tools: Option<Arc<dyn ToolInvoker>>,
    callbacks: CallbackChain,
}

impl Leaf {
    pub fn new(name: impl Into<String>, behavior: impl LeafBehavior + 'static) -> Self {
        Self {
            name: name.into(),
            behavior: Arc::new(behavior),
            model: None,
            tools: None,
            callbacks: CallbackChain::default(),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: Arc<dyn ModelInvoker>) -> Self {
        self.model = Some(model);
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = Some(tools);
        self
    }

    #[must_use]
    pub fn with_callbacks(mut self, callbacks: CallbackChain) -> Self {
        self.callbacks = callbacks;
        self
    }
}

impl std::fmt::Debug for Leaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leaf")
            .field("name", &self.name)
            .field("has_model", &self.model.is_some())
            .field("has_tools", &self.tools.is_some())
            .finish()
    }
}

#[async_trait]
impl WorkUnit for Leaf {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(unit = %self.name, branch = %ctx.branch()))]
    async fn invoke(&self, ctx: &mut ExecutionContext) -> BranchOutcome {
        if let Some(terminal) = ctx.boundary_check() {
            return BranchOutcome::new(terminal, &self.name, ctx.branch().clone());
        }

        let start = LeafStart {
            leaf: self.name.clone(),
            branch: ctx.branch().clone(),
        };
        let decided = {
            let mut store = ctx.store().lock();
            self.callbacks.run_before_leaf(&start, &mut store)
        };

        let mut suppressed = false;
        let mut transfer = None;
        let provisional = match decided {
            CallbackOutcome::Substitute(event) => {
                suppressed = event.actions.suppress_downstream;
                transfer = event.actions.transfer_to.clone();
                ctx.emit(event);
                TerminalKind::Completed
            }
            CallbackOutcome::Abort(message) => {
                let err = UnitError::child_failure(&self.name, &message);
                tracing::warn!(leaf = %self.name, %message, "before-leaf callback aborted");
                failed(&self.name, ctx.branch(), &err)
            }
            CallbackOutcome::Continue => {
                let mut leaf_ctx = LeafContext {
                    exec: ctx,
                    leaf: self,
                    suppressed: false,
                    transfer: None,
                };
                match self.behavior.run(&mut leaf_ctx).await {
                    Ok(LeafFinish::Completed) => {
                        suppressed = leaf_ctx.suppressed;
                        transfer = leaf_ctx.transfer.take();
                        TerminalKind::Completed
                    }
                    Ok(LeafFinish::Suspended { correlation_id }) => {
                        TerminalKind::Suspended { correlation_id }
                    }
                    Err(err) => {
                        tracing::warn!(leaf = %self.name, error = %err, "leaf behavior failed");
                        failed(&self.name, ctx.branch(), &err)
                    }
                }
            }
        };

        let terminal = if suppressed {
            provisional
        } else {
            self.run_after_leaf(ctx, provisional, &mut transfer)
        };

        BranchOutcome::new(terminal, &self.name, ctx.branch().clone())
            .with_escalated(ctx.escalated())
            .with_transfer(transfer)
    }
}

impl Leaf {
    /// After-leaf boundary. A `Substitute` turns a completed or failed
    /// provisional terminal into `Completed` (the ignorable-failure hook);
    /// suspension and cancellation terminals pass through untouched.
    fn run_after_leaf(
        &self,
        ctx: &mut ExecutionContext,
        provisional: TerminalKind,
        transfer: &mut Option<String>,
    ) -> TerminalKind {
        let end = LeafEnd {
            leaf: self.name.clone(),
            branch: ctx.branch().clone(),
            terminal: provisional.clone(),
        };
        let decided = {
            let mut store = ctx.store().lock();
            self.callbacks.run_after_leaf(&end, &mut store)
        };
        match decided {
            CallbackOutcome::Continue => provisional,
            CallbackOutcome::Substitute(event) => match provisional {
                TerminalKind::Completed | TerminalKind::Failed { .. } => {
                    if let Some(target) = event.actions.transfer_to.clone() {
                        *transfer = Some(target);
                    }
                    ctx.emit(event);
                    TerminalKind::Completed
                }
                other => {
                    tracing::warn!(
                        leaf = %self.name,
                        terminal = other.label(),
                        "after-leaf substitute ignored for this terminal"
                    );
                    other
                }
            },
            CallbackOutcome::Abort(message) => {
                let err = UnitError::child_failure(&self.name, &message);
                tracing::warn!(leaf = %self.name, %message, "after-leaf callback aborted");
                failed(&self.name, ctx.branch(), &err)
            }
        }
    }
}

/// Behavior-facing handle: event emission, state reads, collaborator calls.
pub struct LeafContext<'a> {
    exec: &'a mut ExecutionContext,
    leaf: &'a Leaf,
    suppressed: bool,
    transfer: Option<String>,
}

impl LeafContext<'_> {
    pub fn author(&self) -> &str {
        &self.leaf.name
    }

    pub fn branch(&self) -> &BranchPath {
        self.exec.branch()
    }

    pub fn invocation_id(&self) -> &str {
        self.exec.invocation_id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.exec.is_cancelled()
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.exec.deadline_exceeded()
    }

    /// Emit one event. State mutations ride on the event's delta and land
    /// in the shared store here, at emission.
    pub fn emit(&mut self, event: Event) {
        self.suppressed = event.actions.suppress_downstream;
        if let Some(target) = event.actions.transfer_to.clone() {
            self.transfer = Some(target);
        }
        self.exec.emit(event);
    }

    /// Shorthand for a plain text event authored by this leaf.
    pub fn emit_text(&mut self, content: impl Into<String>) {
        let event = Event::text(self.leaf.name.clone(), content);
        self.emit(event);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.exec.get_state(key)
    }

    pub fn require(&self, key: &str) -> Result<Value, StateError> {
        self.exec.require_state(key)
    }

    /// Payload supplied by `Runner::resume` for this correlation id, if the
    /// invocation was resumed.
    pub fn resume_payload(&self, correlation_id: &str) -> Option<Value> {
        self.exec.resume_payload(correlation_id)
    }

    /// Call the leaf's model collaborator through the model callback
    /// boundary. The resulting event (or a substitute) is emitted and
    /// returned.
    pub async fn call_model(&mut self, request: ModelRequest) -> Result<Event, UnitError> {
        let payload = ModelCall {
            leaf: self.leaf.name.clone(),
            request: request.clone(),
        };
        let decided = {
            let mut store = self.exec.store().lock();
            self.leaf.callbacks.run_before_model(&payload, &mut store)
        };
        match decided {
            CallbackOutcome::Substitute(event) => return Ok(self.emit_stamped(event)),
            CallbackOutcome::Abort(message) => {
                return Err(UnitError::child_failure(&self.leaf.name, message));
            }
            CallbackOutcome::Continue => {}
        }

        let invoker = self.leaf.model.as_ref().ok_or_else(|| {
            CollaboratorError::provider("model", "no model invoker attached to this leaf")
        })?;
        let event = invoker.call(request, &self.call_context()).await?;
        self.finish_model_exchange(event)
    }

    /// Call the leaf's tool collaborator through the tool callback boundary.
    /// Emits a `FunctionCall` event for the request, then the response event
    /// (or a substitute).
    pub async fn call_tool(&mut self, name: &str, args: Value) -> Result<Event, UnitError> {
        let payload = ToolCall {
            leaf: self.leaf.name.clone(),
            name: name.to_string(),
            args: args.clone(),
        };
        let decided = {
            let mut store = self.exec.store().lock();
            self.leaf.callbacks.run_before_tool(&payload, &mut store)
        };
        match decided {
            CallbackOutcome::Substitute(event) => return Ok(self.emit_stamped(event)),
            CallbackOutcome::Abort(message) => {
                return Err(UnitError::child_failure(&self.leaf.name, message));
            }
            CallbackOutcome::Continue => {}
        }

        let invoker = self.leaf.tools.as_ref().ok_or_else(|| {
            CollaboratorError::provider("tool", "no tool invoker attached to this leaf")
        })?;
        let call_event = Event::function_call(self.leaf.name.clone(), name, args.clone());
        self.emit(call_event);

        let event = invoker.call(name, args, &self.call_context()).await?;
        self.finish_tool_exchange(event)
    }

    fn finish_model_exchange(&mut self, mut event: Event) -> Result<Event, UnitError> {
        event.author = self.leaf.name.clone();
        if event.actions.suppress_downstream {
            return Ok(self.emit_stamped(event));
        }
        let reply = ModelReply {
            leaf: self.leaf.name.clone(),
            event: event.clone(),
        };
        let decided = {
            let mut store = self.exec.store().lock();
            self.leaf.callbacks.run_after_model(&reply, &mut store)
        };
        match decided {
            CallbackOutcome::Continue => Ok(self.emit_stamped(event)),
            CallbackOutcome::Substitute(substitute) => Ok(self.emit_stamped(substitute)),
            CallbackOutcome::Abort(message) => {
                Err(UnitError::child_failure(&self.leaf.name, message))
            }
        }
    }

    fn finish_tool_exchange(&mut self, mut event: Event) -> Result<Event, UnitError> {
        event.author = self.leaf.name.clone();
        if event.actions.suppress_downstream {
            return Ok(self.emit_stamped(event));
        }
        let reply = ToolReply {
            leaf: self.leaf.name.clone(),
            event: event.clone(),
        };
        let decided = {
            let mut store = self.exec.store().lock();
            self.leaf.callbacks.run_after_tool(&reply, &mut store)
        };
        match decided {
            CallbackOutcome::Continue => Ok(self.emit_stamped(event)),
            CallbackOutcome::Substitute(substitute) => Ok(self.emit_stamped(substitute)),
            CallbackOutcome::Abort(message) => {
                Err(UnitError::child_failure(&self.leaf.name, message))
            }
        }
    }

    fn emit_stamped(&mut self, mut event: Event) -> Event {
        event.author = self.leaf.name.clone();
        event.branch = self.exec.branch().clone();
        self.emit(event.clone());
        event
    }

    fn call_context(&self) -> CallContext {
        CallContext {
            invocation_id: self.exec.invocation_id().to_string(),
            branch: self.exec.branch().clone(),
            cancel: self.exec.cancel_signal().clone(),
            deadline: self.exec.deadline(),
        }
    }
}
