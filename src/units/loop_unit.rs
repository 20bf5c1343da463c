//! Bounded iteration over one body unit.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::context::ExecutionContext;
use crate::events::TerminalKind;

use super::{failed, validate_children, BranchOutcome, ConfigurationError, UnitError, WorkUnit};

/// Repeats its body against the same shared context, so state accumulates
/// across iterations. The bound is mandatory and positive. Iteration stops
/// at the bound, on an escalating iteration (the escalate signal is consumed
/// here, not propagated), or on cancellation/deadline observed between
/// iterations. A fatal body outcome aborts the loop unchanged.
pub struct Loop {
    name: String,
    max_iterations: u32,
    // Single body, held as a one-element list so `children()` has a slice
    // to hand out.
    body: Vec<Arc<dyn WorkUnit>>,
}

impl Loop {
    pub fn new(
        name: impl Into<String>,
        body: Arc<dyn WorkUnit>,
        max_iterations: u32,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if max_iterations == 0 {
            return Err(ConfigurationError::UnboundedLoop { unit: name });
        }
        let body = vec![body];
        validate_children(&name, &body)?;
        Ok(Self {
            name,
            max_iterations,
            body,
        })
    }

    fn body(&self) -> &Arc<dyn WorkUnit> {
        &self.body[0]
    }
}

impl std::fmt::Debug for Loop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loop")
            .field("name", &self.name)
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}

#[async_trait]
impl WorkUnit for Loop {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> &[Arc<dyn WorkUnit>] {
        &self.body
    }

    #[instrument(skip_all, fields(unit = %self.name, branch = %ctx.branch()))]
    async fn invoke(&self, ctx: &mut ExecutionContext) -> BranchOutcome {
        // Resume lands on the iteration that suspended; earlier iterations
        // already ran. A cursor index at or past the bound can only come
        // from a corrupted resume record.
        let mut iteration = ctx.resume_child_index().unwrap_or(0);
        if iteration >= self.max_iterations as usize {
            let err = UnitError::LoopBoundExceeded {
                unit: self.name.clone(),
                bound: self.max_iterations,
            };
            tracing::error!(unit = %self.name, iteration, "resume cursor past loop bound");
            return BranchOutcome::new(
                failed(&self.name, ctx.branch(), &err),
                &self.name,
                ctx.branch().clone(),
            );
        }

        while iteration < self.max_iterations as usize {
            if let Some(terminal) = ctx.boundary_check() {
                return BranchOutcome::new(terminal, &self.name, ctx.branch().clone());
            }

            let body = self.body();
            let mut child_ctx = ctx.child(body.name(), iteration);
            let outcome = body.invoke(&mut child_ctx).await;
            ctx.drop_branch_temp(child_ctx.branch());

            if outcome.is_fatal() {
                return outcome;
            }
            if outcome.escalated {
                tracing::debug!(unit = %self.name, iteration, "loop stopped by escalation");
                break;
            }
            iteration += 1;
        }

        BranchOutcome::new(TerminalKind::Completed, &self.name, ctx.branch().clone())
    }
}
