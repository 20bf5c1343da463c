//! Invocation status, archived snapshots, and the snapshot-store seam.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::events::{Event, TerminalKind};

/// Lifecycle of one submitted invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
    DeadlineExceeded,
    /// Parked awaiting `Runner::resume`.
    Suspended,
}

impl InvocationStatus {
    pub fn from_terminal(terminal: &TerminalKind) -> Self {
        match terminal {
            TerminalKind::Completed => InvocationStatus::Completed,
            TerminalKind::Cancelled => InvocationStatus::Cancelled,
            TerminalKind::Failed { .. } => InvocationStatus::Failed,
            TerminalKind::DeadlineExceeded => InvocationStatus::DeadlineExceeded,
            TerminalKind::Suspended { .. } => InvocationStatus::Suspended,
        }
    }

    /// True once the invocation can make no further progress without
    /// external input (`Suspended`) or at all.
    pub fn is_settled(self) -> bool {
        !matches!(self, InvocationStatus::Running)
    }

    /// True for end states that will never run again.
    pub fn is_final(self) -> bool {
        !matches!(self, InvocationStatus::Running | InvocationStatus::Suspended)
    }
}

/// Flat record of a finished (or inspected) invocation: its state map and
/// the full ordered event log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvocationSnapshot {
    pub invocation_id: String,
    pub status: InvocationStatus,
    pub state: FxHashMap<String, Value>,
    pub events: Vec<Event>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum SnapshotError {
    #[error("snapshot serialization failed: {0}")]
    #[diagnostic(code(branchwork::snapshot::serialization))]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot backend error: {0}")]
    #[diagnostic(code(branchwork::snapshot::backend))]
    Backend(String),
}

/// Archive seam for finished invocations. Durable backends are
/// collaborators; the crate ships [`InMemorySnapshotStore`].
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: InvocationSnapshot) -> Result<(), SnapshotError>;
    async fn load(&self, invocation_id: &str) -> Result<Option<InvocationSnapshot>, SnapshotError>;
}

/// Keeps snapshots in a map. Useful for tests and single-process callers.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    inner: Mutex<FxHashMap<String, InvocationSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: InvocationSnapshot) -> Result<(), SnapshotError> {
        self.inner
            .lock()
            .insert(snapshot.invocation_id.clone(), snapshot);
        Ok(())
    }

    async fn load(&self, invocation_id: &str) -> Result<Option<InvocationSnapshot>, SnapshotError> {
        Ok(self.inner.lock().get(invocation_id).cloned())
    }
}
