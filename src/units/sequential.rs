//! Strict in-order composition over the shared store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::context::ExecutionContext;

use super::{validate_children, BranchOutcome, ConfigurationError, WorkUnit};

/// Runs children in declared order; each child observes every mutation its
/// predecessors made. The first fatal child outcome aborts the sequence and
/// propagates unchanged. Escalation stops the sequence early and propagates
/// upward; a `transfer_to` naming a later sibling jumps forward to it.
/// Cancellation and the deadline are checked between children, never
/// mid-child.
pub struct Sequential {
    name: String,
    children: Vec<Arc<dyn WorkUnit>>,
}

impl Sequential {
    pub fn new(
        name: impl Into<String>,
        children: Vec<Arc<dyn WorkUnit>>,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        validate_children(&name, &children)?;
        Ok(Self { name, children })
    }
}

impl std::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequential")
            .field("name", &self.name)
            .field("children", &self.children.len())
            .finish()
    }
}

#[async_trait]
impl WorkUnit for Sequential {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> &[Arc<dyn WorkUnit>] {
        &self.children
    }

    #[instrument(skip_all, fields(unit = %self.name, branch = %ctx.branch()))]
    async fn invoke(&self, ctx: &mut ExecutionContext) -> BranchOutcome {
        let resume_index = ctx.resume_child_index();
        let mut index = 0;
        while index < self.children.len() {
            // Fast-forward to the suspended child on resume; earlier
            // siblings already ran and their state is restored.
            if resume_index.is_some_and(|r| index < r) {
                index += 1;
                continue;
            }
            if let Some(terminal) = ctx.boundary_check() {
                return BranchOutcome::new(terminal, &self.name, ctx.branch().clone());
            }

            let child = &self.children[index];
            let mut child_ctx = ctx.child(child.name(), index);
            let outcome = child.invoke(&mut child_ctx).await;
            ctx.drop_branch_temp(child_ctx.branch());

            if outcome.is_fatal() {
                return outcome;
            }
            if outcome.escalated {
                return BranchOutcome::completed(&self.name, ctx.branch().clone())
                    .with_escalated(true);
            }
            if let Some(target) = &outcome.transfer_to {
                match self.children.iter().position(|c| c.name() == *target) {
                    Some(jump) if jump > index => {
                        tracing::debug!(
                            unit = %self.name,
                            from = %child.name(),
                            to = %target,
                            "transfer jump"
                        );
                        index = jump;
                        continue;
                    }
                    _ => {
                        tracing::warn!(
                            unit = %self.name,
                            target = %target,
                            "ignoring transfer to a non-later sibling"
                        );
                    }
                }
            }
            index += 1;
        }
        BranchOutcome::completed(&self.name, ctx.branch().clone())
    }
}
