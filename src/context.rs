//! Per-invocation execution handles.
//!
//! An [`ExecutionContext`] is what a work unit receives when invoked: the
//! shared state store, the event emitter, the branch path identifying its
//! position in the tree, the invocation's cancellation signal and optional
//! deadline, and (after a resume) the cursor addressing the suspended branch.
//! Child contexts derive from the parent by appending one branch segment;
//! parallel children additionally get a forked store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::branch::BranchPath;
use crate::events::{Event, InvocationEmitter, TerminalKind};
use crate::state::{StateError, StateStore};

/// Cooperative cancellation flag shared by every context of one invocation.
///
/// Cancellation propagates downward only: composites check it at child
/// boundaries, and collaborators receive it via `CallContext`. In-flight
/// children are never interrupted mid-step.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Address of the branch that suspended, carried by a resumed invocation.
/// Composites fast-forward children declared before the cursor's segment at
/// their depth; the suspended leaf itself re-runs and reads its payload.
#[derive(Debug)]
pub(crate) struct ResumeCursor {
    pub branch: BranchPath,
}

/// Execution handle passed to [`WorkUnit::invoke`](crate::units::WorkUnit).
#[derive(Debug)]
pub struct ExecutionContext {
    invocation_id: String,
    branch: BranchPath,
    store: Arc<Mutex<StateStore>>,
    emitter: InvocationEmitter,
    cancel: CancelSignal,
    deadline: Option<Instant>,
    resume: Option<Arc<ResumeCursor>>,
    escalated: bool,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn root(
        invocation_id: impl Into<String>,
        root_name: &str,
        store: Arc<Mutex<StateStore>>,
        emitter: InvocationEmitter,
        cancel: CancelSignal,
        deadline: Option<Instant>,
        resume: Option<Arc<ResumeCursor>>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            branch: BranchPath::root(root_name),
            store,
            emitter,
            cancel,
            deadline,
            resume,
            escalated: false,
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn branch(&self) -> &BranchPath {
        &self.branch
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Terminal to propagate if cancellation or the deadline has tripped.
    /// Composites call this at every child boundary.
    pub fn boundary_check(&self) -> Option<TerminalKind> {
        if self.is_cancelled() {
            Some(TerminalKind::Cancelled)
        } else if self.deadline_exceeded() {
            Some(TerminalKind::DeadlineExceeded)
        } else {
            None
        }
    }

    /// True once any event emitted through this context asked to escalate.
    pub fn escalated(&self) -> bool {
        self.escalated
    }

    /// Emit one event: stamp it with this branch, apply its state delta to
    /// the store (exactly once, here), record escalation, then publish.
    pub fn emit(&mut self, mut event: Event) {
        event.branch = self.branch.clone();
        if !event.actions.state_delta.is_empty() {
            self.store
                .lock()
                .apply_delta(&event.actions.state_delta, &self.branch);
        }
        if event.actions.escalate {
            self.escalated = true;
        }
        self.emitter.emit(event);
    }

    pub fn get_state(&self, key: &str) -> Option<Value> {
        self.store.lock().get(key).cloned()
    }

    pub fn require_state(&self, key: &str) -> Result<Value, StateError> {
        self.store.lock().require(key)
    }

    /// Payload merged in by `Runner::resume`, if this invocation was resumed
    /// for the given correlation id.
    pub fn resume_payload(&self, correlation_id: &str) -> Option<Value> {
        self.get_state(&format!("resume:{correlation_id}"))
    }

    /// Derive a child context sharing this store (Sequential/Loop/Custom).
    pub(crate) fn child(&self, name: &str, index: usize) -> ExecutionContext {
        let branch = self.branch.child(name, index);
        let resume = self.resume_for(&branch);
        ExecutionContext {
            invocation_id: self.invocation_id.clone(),
            branch,
            store: Arc::clone(&self.store),
            emitter: self.emitter.clone(),
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            resume,
            escalated: false,
        }
    }

    /// Derive a child context over a forked store (Parallel). Returns the
    /// fork so the join barrier can reclaim its journal.
    pub(crate) fn fork_child(
        &self,
        name: &str,
        index: usize,
    ) -> (ExecutionContext, Arc<Mutex<StateStore>>) {
        let fork = Arc::new(Mutex::new(self.store.lock().fork()));
        let branch = self.branch.child(name, index);
        let resume = self.resume_for(&branch);
        let ctx = ExecutionContext {
            invocation_id: self.invocation_id.clone(),
            branch,
            store: Arc::clone(&fork),
            emitter: self.emitter.clone(),
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            resume,
            escalated: false,
        };
        (ctx, fork)
    }

    /// Declaration index of the child on the resume path at this depth, if
    /// this context lies on the cursor's path.
    pub(crate) fn resume_child_index(&self) -> Option<usize> {
        let cursor = self.resume.as_ref()?;
        if !cursor.branch.starts_with(&self.branch) {
            return None;
        }
        cursor
            .branch
            .segment_at(self.branch.depth())
            .map(|segment| segment.index)
    }

    /// Drop `temp:` keys owned by a completed child branch.
    pub(crate) fn drop_branch_temp(&self, branch: &BranchPath) {
        self.store.lock().drop_branch_temp(branch);
    }

    pub(crate) fn store(&self) -> &Arc<Mutex<StateStore>> {
        &self.store
    }

    fn resume_for(&self, child_branch: &BranchPath) -> Option<Arc<ResumeCursor>> {
        self.resume
            .as_ref()
            .filter(|cursor| cursor.branch.starts_with(child_branch))
            .map(Arc::clone)
    }
}
