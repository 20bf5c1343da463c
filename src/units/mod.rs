//! Work units: the composable nodes of an invocation tree.
//!
//! Five shapes share one contract. A [`Leaf`] wraps a single behavior
//! (model call, tool call, or arbitrary async code). [`Sequential`],
//! [`Parallel`], and [`Loop`] compose other units with fixed control flow,
//! and [`Custom`] delegates control flow to a caller-supplied routine over
//! its declared children. Every unit pushes events through its context's
//! emitter in causal order and returns a [`BranchOutcome`]; failures are
//! data, never unwinding.

mod custom;
mod leaf;
mod loop_unit;
mod parallel;
mod sequential;

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

pub use custom::{Custom, CustomContext, CustomRoutine};
pub use leaf::{Leaf, LeafBehavior, LeafContext, LeafFinish};
pub use loop_unit::Loop;
pub use parallel::Parallel;
pub use sequential::Sequential;

use crate::branch::BranchPath;
use crate::collaborators::CollaboratorError;
use crate::context::ExecutionContext;
use crate::events::{FailureDetail, TerminalKind};
use crate::state::StateError;

/// Polymorphic contract every unit shape implements.
///
/// `invoke` emits this unit's events through the context and returns how the
/// branch ended. Children are fixed at construction; composites own theirs
/// as `Arc`s so the same subtree can be shared across siblings (sharing is
/// fine, a unit appearing as its own ancestor is not).
#[async_trait]
pub trait WorkUnit: Send + Sync {
    fn name(&self) -> &str;

    fn children(&self) -> &[Arc<dyn WorkUnit>] {
        &[]
    }

    async fn invoke(&self, ctx: &mut ExecutionContext) -> BranchOutcome;
}

/// How one branch of the tree ended.
#[derive(Clone, Debug)]
pub struct BranchOutcome {
    pub terminal: TerminalKind,
    /// Unit that determined the terminal (the failing child, for aborts).
    pub author: String,
    pub branch: BranchPath,
    /// Escalation observed in this branch; consumed by `Loop`, propagated
    /// by `Sequential`.
    pub escalated: bool,
    /// Forward-jump request honored by the enclosing `Sequential`.
    pub transfer_to: Option<String>,
}

impl BranchOutcome {
    pub fn new(terminal: TerminalKind, author: impl Into<String>, branch: BranchPath) -> Self {
        Self {
            terminal,
            author: author.into(),
            branch,
            escalated: false,
            transfer_to: None,
        }
    }

    pub fn completed(author: impl Into<String>, branch: BranchPath) -> Self {
        Self::new(TerminalKind::Completed, author, branch)
    }

    #[must_use]
    pub fn with_escalated(mut self, escalated: bool) -> Self {
        self.escalated = escalated;
        self
    }

    #[must_use]
    pub fn with_transfer(mut self, transfer_to: Option<String>) -> Self {
        self.transfer_to = transfer_to;
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.terminal.is_fatal()
    }
}

/// Malformed tree, caught at construction. Never raised at runtime.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigurationError {
    #[error("unit '{unit}' appears as its own ancestor")]
    #[diagnostic(
        code(branchwork::config::cyclic_graph),
        help("a unit may be shared across siblings, but the child tree must stay acyclic")
    )]
    CyclicGraph { unit: String },

    #[error("loop '{unit}' has no positive iteration bound")]
    #[diagnostic(
        code(branchwork::config::unbounded_loop),
        help("every Loop requires max_iterations >= 1")
    )]
    UnboundedLoop { unit: String },

    #[error("composite '{unit}' has no children")]
    #[diagnostic(code(branchwork::config::empty_composite))]
    EmptyComposite { unit: String },
}

/// Runtime failures inside a unit. These become `Failed` branch outcomes
/// (or the matching terminal for cancellation/deadline), never panics.
#[derive(Debug, Error, Diagnostic)]
pub enum UnitError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("child unit '{unit}' failed: {message}")]
    #[diagnostic(code(branchwork::unit::child_failure))]
    ChildFailure { unit: String, message: String },

    #[error("'{unit}' is not a declared child of this composite")]
    #[diagnostic(
        code(branchwork::unit::unknown_child),
        help("custom routines may only run children declared at construction")
    )]
    UnknownChild { unit: String },

    #[error("cancellation requested")]
    #[diagnostic(code(branchwork::unit::cancelled))]
    CancellationRequested,

    #[error("deadline exceeded")]
    #[diagnostic(code(branchwork::unit::deadline))]
    DeadlineExceeded,

    #[error("loop '{unit}' exceeded its iteration bound of {bound}")]
    #[diagnostic(code(branchwork::unit::loop_bound))]
    LoopBoundExceeded { unit: String, bound: u32 },
}

impl UnitError {
    pub fn child_failure(unit: impl Into<String>, message: impl ToString) -> Self {
        Self::ChildFailure {
            unit: unit.into(),
            message: message.to_string(),
        }
    }
}

/// Build a single-entry `Failed` terminal for a unit error.
pub(crate) fn failed(unit: &str, branch: &BranchPath, err: &UnitError) -> TerminalKind {
    TerminalKind::Failed {
        failures: vec![FailureDetail {
            unit: unit.to_string(),
            branch: branch.clone(),
            message: err.to_string(),
        }],
    }
}

/// Reject empty composites and any unit appearing as its own ancestor.
pub(crate) fn validate_children(
    name: &str,
    children: &[Arc<dyn WorkUnit>],
) -> Result<(), ConfigurationError> {
    if children.is_empty() {
        return Err(ConfigurationError::EmptyComposite {
            unit: name.to_string(),
        });
    }
    let mut path: Vec<*const ()> = Vec::new();
    for child in children {
        walk(child, &mut path)?;
    }
    Ok(())
}

fn walk(unit: &Arc<dyn WorkUnit>, path: &mut Vec<*const ()>) -> Result<(), ConfigurationError> {
    let ptr = Arc::as_ptr(unit).cast::<()>();
    if path.contains(&ptr) {
        return Err(ConfigurationError::CyclicGraph {
            unit: unit.name().to_string(),
        });
    }
    path.push(ptr);
    for child in unit.children() {
        walk(child, path)?;
    }
    path.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use super::*;

    struct Noop;

    #[async_trait]
    impl LeafBehavior for Noop {
        async fn run(&self, _ctx: &mut LeafContext<'_>) -> Result<LeafFinish, UnitError> {
            Ok(LeafFinish::Completed)
        }
    }

    // Children land after construction so the node can hold an Arc to
    // itself. The resulting reference cycle leaks, which a test can afford.
    struct SelfRef {
        children: OnceLock<Vec<Arc<dyn WorkUnit>>>,
    }

    #[async_trait]
    impl WorkUnit for SelfRef {
        fn name(&self) -> &str {
            "ouroboros"
        }

        fn children(&self) -> &[Arc<dyn WorkUnit>] {
            self.children.get().map(Vec::as_slice).unwrap_or(&[])
        }

        async fn invoke(&self, _ctx: &mut ExecutionContext) -> BranchOutcome {
            unreachable!("construction must reject this tree")
        }
    }

    #[test]
    fn cyclic_trees_are_rejected_at_construction() {
        let node = Arc::new(SelfRef {
            children: OnceLock::new(),
        });
        let as_unit: Arc<dyn WorkUnit> = node.clone();
        node.children
            .set(vec![as_unit.clone()])
            .unwrap_or_else(|_| unreachable!());

        let err = Sequential::new("looped", vec![as_unit]).unwrap_err();
        assert!(matches!(err, ConfigurationError::CyclicGraph { unit } if unit == "ouroboros"));
    }

    #[test]
    fn shared_subtrees_across_siblings_are_accepted() {
        let shared: Arc<dyn WorkUnit> = Arc::new(Leaf::new("shared", Noop));
        let left: Arc<dyn WorkUnit> =
            Arc::new(Sequential::new("left", vec![shared.clone()]).unwrap());
        let right: Arc<dyn WorkUnit> =
            Arc::new(Sequential::new("right", vec![shared]).unwrap());

        assert!(Sequential::new("fanin", vec![left, right]).is_ok());
    }
}
