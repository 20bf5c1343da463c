//! Seams for the work the engine orchestrates but does not implement.
//!
//! Model inference and tool execution are collaborators: callers hand a
//! [`ModelInvoker`] / [`ToolInvoker`] to a leaf and the engine wraps each
//! call in its callback boundaries and event bookkeeping. Both receive a
//! [`CallContext`] and are expected to observe its cancellation signal and
//! deadline.

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use crate::branch::BranchPath;
use crate::context::CancelSignal;
use crate::events::Event;

/// Opaque request forwarded to a model provider.
#[derive(Clone, Debug)]
pub struct ModelRequest {
    pub prompt: String,
    pub params: Value,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: Value::Null,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Invocation metadata handed to collaborators alongside each call.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub invocation_id: String,
    pub branch: BranchPath,
    pub cancel: CancelSignal,
    pub deadline: Option<Instant>,
}

/// Errors a collaborator may surface. The engine wraps these into a `Failed`
/// outcome for the owning leaf; they never unwind the invocation.
#[derive(Debug, Error, Diagnostic)]
pub enum CollaboratorError {
    #[error("{provider} call failed: {message}")]
    #[diagnostic(code(branchwork::collaborator::provider))]
    Provider { provider: String, message: String },

    #[error("collaborator call timed out")]
    #[diagnostic(code(branchwork::collaborator::timeout))]
    Timeout,

    #[error("collaborator call observed cancellation")]
    #[diagnostic(code(branchwork::collaborator::cancelled))]
    Cancelled,
}

impl CollaboratorError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Model inference seam. Implementations return a fully-formed [`Event`]
/// (typically text or a partial result); the engine re-stamps author and
/// branch before emission.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn call(&self, request: ModelRequest, ctx: &CallContext)
    -> Result<Event, CollaboratorError>;
}

/// Tool execution seam.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call(
        &self,
        name: &str,
        args: Value,
        ctx: &CallContext,
    ) -> Result<Event, CollaboratorError>;
}
