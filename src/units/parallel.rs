//! Concurrent fan-out with a deterministic join barrier.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::context::ExecutionContext;
use crate::events::{FailureDetail, TerminalKind};

use super::{validate_children, BranchOutcome, ConfigurationError, WorkUnit};

/// Spawns every child concurrently, each over a forked store (snapshot plus
/// a private write journal). Events forward to the shared hub as produced;
/// cross-child interleaving is unspecified. At the join barrier the journals
/// are replayed onto the parent store in declaration order, so later-declared
/// children win key conflicts and the merged state never depends on task
/// scheduling. One child's failure does not cancel its siblings; the join
/// reports the full failure set.
pub struct Parallel {
    name: String,
    children: Vec<Arc<dyn WorkUnit>>,
}

impl Parallel {
    pub fn new(
        name: impl Into<String>,
        children: Vec<Arc<dyn WorkUnit>>,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        validate_children(&name, &children)?;
        Ok(Self { name, children })
    }
}

impl std::fmt::Debug for Parallel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parallel")
            .field("name", &self.name)
            .field("children", &self.children.len())
            .finish()
    }
}

#[async_trait]
impl WorkUnit for Parallel {
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

        // On resume only the suspended child re-runs; its siblings finished
        // before the suspension and their journals were already merged.
        let resume_index = ctx.resume_child_index();

        let mut tasks = Vec::with_capacity(self.children.len());
        for (index, child) in self.children.iter().enumerate() {
            if resume_index.is_some_and(|r| index != r) {
                continue;
            }
            let (mut child_ctx, fork) = ctx.fork_child(child.name(), index);
            let child = Arc::clone(child);
            let handle = tokio::spawn(async move { child.invoke(&mut child_ctx).await });
            tasks.push((index, fork, handle));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (index, fork, handle) in tasks {
            let child_name = self.children[index].name().to_string();
            let child_branch = ctx.branch().child(&child_name, index);
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    tracing::error!(
                        unit = %self.name,
                        child = %child_name,
                        error = %join_err,
                        "parallel child task aborted"
                    );
                    BranchOutcome::new(
                        TerminalKind::Failed {
                            failures: vec![FailureDetail {
                                unit: child_name.clone(),
                                branch: child_branch.clone(),
                                message: join_err.to_string(),
                            }],
                        },
                        child_name.clone(),
                        child_branch.clone(),
                    )
                }
            };

            // Barrier merge, declaration order. Temp keys owned by the
            // finished child drop inside the fork first so the journal
            // carries their removal.
            let journal = {
                let mut fork_store = fork.lock();
                fork_store.drop_branch_temp(&child_branch);
                fork_store.take_journal()
            };
            ctx.store().lock().apply_journal(journal, &child_branch);
            tracing::debug!(
                unit = %self.name,
                child = %child_name,
                terminal = outcome.terminal.label(),
                "parallel join merged child journal"
            );
            outcomes.push(outcome);
        }

        self.resolve(ctx, outcomes)
    }
}

impl Parallel {
    /// Join resolution priority: Cancelled > DeadlineExceeded > Suspended >
    /// Failed > Completed. Escalation flags from all children are OR'd.
    fn resolve(&self, ctx: &ExecutionContext, outcomes: Vec<BranchOutcome>) -> BranchOutcome {
        let mut escalated = false;
        let mut failures = Vec::new();
        let mut suspended: Option<BranchOutcome> = None;
        let mut saw_cancelled = false;
        let mut saw_deadline = false;

        for outcome in outcomes {
            escalated |= outcome.escalated;
            match outcome.terminal {
                TerminalKind::Completed => {}
                TerminalKind::Cancelled => saw_cancelled = true,
                TerminalKind::DeadlineExceeded => saw_deadline = true,
                TerminalKind::Suspended { .. } => {
                    if suspended.is_none() {
                        suspended = Some(outcome);
                    }
                }
                TerminalKind::Failed {
                    failures: mut child_failures,
                } => failures.append(&mut child_failures),
            }
        }

        let terminal = if saw_cancelled {
            TerminalKind::Cancelled
        } else if saw_deadline {
            TerminalKind::DeadlineExceeded
        } else if let Some(outcome) = suspended {
            return outcome.with_escalated(escalated);
        } else if !failures.is_empty() {
            TerminalKind::Failed { failures }
        } else {
            TerminalKind::Completed
        };

        BranchOutcome::new(terminal, &self.name, ctx.branch().clone()).with_escalated(escalated)
    }
}
