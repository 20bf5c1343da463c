//! Caller-defined control flow over declared children.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::instrument;

use crate::context::ExecutionContext;
use crate::events::{Event, TerminalKind};
use crate::state::StateError;

use super::{failed, validate_children, BranchOutcome, ConfigurationError, UnitError, WorkUnit};

/// The driver of a [`Custom`] unit: runs any subset of the declared
/// children, in any order, repeatedly, branching on store contents.
#[async_trait]
pub trait CustomRoutine: Send + Sync {
    async fn drive(&self, ctx: &mut CustomContext<'_>) -> Result<(), UnitError>;
}

/// Composite whose control flow lives in a [`CustomRoutine`] instead of a
/// fixed schedule. Children are still declared up front; the routine may
/// only run those.
pub struct Custom {
    name: String,
    children: Vec<Arc<dyn WorkUnit>>,
    routine: Arc<dyn CustomRoutine>,
}

impl Custom {
    pub fn new(
        name: impl Into<String>,
        children: Vec<Arc<dyn WorkUnit>>,
        routine: impl CustomRoutine + 'static,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        validate_children(&name, &children)?;
        Ok(Self {
            name,
            children,
            routine: Arc::new(routine),
        })
    }
}

impl std::fmt::Debug for Custom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Custom")
            .field("name", &self.name)
            .field("children", &self.children.len())
            .finish()
    }
}

#[async_trait]
impl WorkUnit for Custom {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> &[Arc<dyn WorkUnit>] {
        &self.children
    }

    #[instrument(skip_all, fields(unit = %self.name, branch = %ctx.branch()))]
    async fn invoke(&self, ctx: &mut ExecutionContext) -> BranchOutcome {
        if let Some(terminal) = ctx.boundary_check() {
            return BranchOutcome::new(terminal, &self.name, ctx.branch().clone());
        }

        let mut routine_ctx = CustomContext {
            name: &self.name,
            exec: ctx,
            children: &self.children,
            run_counts: vec![0; self.children.len()],
            interrupted: None,
            escalated: false,
        };

        let driven = self.routine.drive(&mut routine_ctx).await;
        let escalated = routine_ctx.escalated;
        let interrupted = routine_ctx.interrupted.take();

        match driven {
            Ok(()) => {
                // Cancellation, deadline, or suspension seen while running a
                // child wins over the routine's own verdict.
                if let Some(outcome) = interrupted {
                    return outcome.with_escalated(escalated);
                }
                BranchOutcome::completed(&self.name, ctx.branch().clone())
                    .with_escalated(escalated)
            }
            Err(UnitError::CancellationRequested) => {
                BranchOutcome::new(TerminalKind::Cancelled, &self.name, ctx.branch().clone())
            }
            Err(UnitError::DeadlineExceeded) => BranchOutcome::new(
                TerminalKind::DeadlineExceeded,
                &self.name,
                ctx.branch().clone(),
            ),
            Err(err) => {
                if let Some(outcome) = interrupted {
                    return outcome.with_escalated(escalated);
                }
                tracing::warn!(unit = %self.name, error = %err, "custom routine failed");
                BranchOutcome::new(
                    failed(&self.name, ctx.branch(), &err),
                    &self.name,
                    ctx.branch().clone(),
                )
            }
        }
    }
}

/// Routine-facing handle: child re-entry, state access, event emission.
pub struct CustomContext<'a> {
    name: &'a str,
    exec: &'a mut ExecutionContext,
    children: &'a [Arc<dyn WorkUnit>],
    // Re-runs of the same child get distinct branch indices so each pass is
    // addressable in the event log.
    run_counts: Vec<usize>,
    interrupted: Option<BranchOutcome>,
    escalated: bool,
}

impl CustomContext<'_> {
    pub fn child_names(&self) -> Vec<&str> {
        self.children.iter().map(|child| child.name()).collect()
    }

    /// Run one declared child to completion and return its outcome. Failed
    /// outcomes come back as data for the routine to react to; cancellation,
    /// deadline expiry, and suspension are recorded and short-circuit the
    /// composite once the routine returns.
    pub async fn run_child(&mut self, name: &str) -> Result<BranchOutcome, UnitError> {
        if self.exec.is_cancelled() {
            return Err(UnitError::CancellationRequested);
        }
        if self.exec.deadline_exceeded() {
            return Err(UnitError::DeadlineExceeded);
        }
        let position = self
            .children
            .iter()
            .position(|child| child.name() == name)
            .ok_or_else(|| UnitError::UnknownChild { unit: name.into() })?;

        let pass = self.run_counts[position];
        self.run_counts[position] += 1;
        let index = position + pass * self.children.len();

        let child = &self.children[position];
        let mut child_ctx = self.exec.child(child.name(), index);
        let outcome = child.invoke(&mut child_ctx).await;
        self.exec.drop_branch_temp(child_ctx.branch());

        self.escalated |= outcome.escalated;
        if matches!(
            outcome.terminal,
            TerminalKind::Cancelled | TerminalKind::DeadlineExceeded | TerminalKind::Suspended { .. }
        ) && self.interrupted.is_none()
        {
            self.interrupted = Some(outcome.clone());
        }
        Ok(outcome)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.exec.get_state(key)
    }

    pub fn require(&self, key: &str) -> Result<Value, StateError> {
        self.exec.require_state(key)
    }

    /// Emit an event authored by the composite itself.
    pub fn emit(&mut self, event: Event) {
        let mut event = event;
        event.author = self.name.to_string();
        self.exec.emit(event);
    }

    pub fn emit_text(&mut self, content: impl Into<String>) {
        let event = Event::text(self.name.to_string(), content);
        self.exec.emit(event);
    }
}
