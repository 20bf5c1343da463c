//! Top-level driver: submit, stream, resume, cancel.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::instrument;
use uuid::Uuid;

use crate::branch::BranchPath;
use crate::context::{CancelSignal, ExecutionContext, ResumeCursor};
use crate::events::{
    Envelope, Event, EventHub, EventSink, EventStream, InvocationEmitter, StdOutSink, TerminalKind,
};
use crate::state::StateStore;
use crate::units::{BranchOutcome, WorkUnit};

use super::config::RunnerConfig;
use super::invocation::{InvocationSnapshot, InvocationStatus, SnapshotStore};

pub type InvocationId = String;

/// Per-invocation overrides for [`Runner::submit_with_options`].
#[derive(Default)]
pub struct InvokeOptions {
    pub deadline: Option<Duration>,
    pub sinks: Vec<Box<dyn EventSink>>,
}

impl InvokeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error("unknown invocation: {id}")]
    #[diagnostic(code(branchwork::runner::unknown_invocation))]
    UnknownInvocation { id: String },

    #[error("invocation {id} is not suspended")]
    #[diagnostic(
        code(branchwork::runner::not_suspended),
        help("resume applies only to invocations whose terminal event was Suspended")
    )]
    NotSuspended { id: String },

    #[error("invocation {id} is suspended under a different correlation id than '{correlation_id}'")]
    #[diagnostic(code(branchwork::runner::correlation_mismatch))]
    CorrelationMismatch { id: String, correlation_id: String },

    #[error("invocation {id} task failed to join: {message}")]
    #[diagnostic(code(branchwork::runner::join_failed))]
    JoinFailed { id: String, message: String },
}

struct Suspension {
    correlation_id: String,
    branch: BranchPath,
}

struct InvocationEntry {
    root: Arc<dyn WorkUnit>,
    store: Arc<Mutex<StateStore>>,
    log: Arc<Mutex<Vec<Event>>>,
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    // Weak so the hub (and with it every live stream) closes when the run
    // segment's emitter drops.
    hub: Mutex<Weak<EventHub>>,
    cancel: CancelSignal,
    deadline: Option<Instant>,
    status: Mutex<InvocationStatus>,
    suspension: Mutex<Option<Suspension>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Drives invocations to completion on the ambient tokio runtime.
///
/// Every submitted invocation gets its own state store, event log, and
/// broadcast hub. Exactly one terminal event ends each run segment's stream;
/// callers branch on [`TerminalKind`], never on errors unwinding out of
/// `submit`.
pub struct Runner {
    config: RunnerConfig,
    archive: Option<Arc<dyn SnapshotStore>>,
    invocations: Mutex<FxHashMap<InvocationId, Arc<InvocationEntry>>>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            archive: None,
            invocations: Mutex::new(FxHashMap::default()),
        }
    }

    /// Archive finished invocations (flat state plus event log) here.
    #[must_use]
    pub fn with_archive(mut self, archive: Arc<dyn SnapshotStore>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Start an invocation of `root` seeded with `initial_state`.
    /// Returns immediately; follow progress via [`Runner::stream`].
    pub fn submit(
        &self,
        root: Arc<dyn WorkUnit>,
        initial_state: FxHashMap<String, Value>,
    ) -> InvocationId {
        self.submit_with_options(root, initial_state, InvokeOptions::default())
    }

    #[instrument(skip_all, fields(root = %root.name()))]
    pub fn submit_with_options(
        &self,
        root: Arc<dyn WorkUnit>,
        initial_state: FxHashMap<String, Value>,
        options: InvokeOptions,
    ) -> InvocationId {
        let id = Uuid::new_v4().to_string();
        let mut sinks = options.sinks;
        if self.config.stdout_events {
            sinks.push(Box::new(StdOutSink::default()));
        }
        let deadline = options
            .deadline
            .or(self.config.default_deadline)
            .map(|timeout| Instant::now() + timeout);

        let entry = Arc::new(InvocationEntry {
            root,
            store: Arc::new(Mutex::new(StateStore::with_initial(initial_state))),
            log: Arc::new(Mutex::new(Vec::new())),
            sinks: Arc::new(Mutex::new(sinks)),
            hub: Mutex::new(Weak::new()),
            cancel: CancelSignal::new(),
            deadline,
            status: Mutex::new(InvocationStatus::Running),
            suspension: Mutex::new(None),
            join: Mutex::new(None),
        });
        self.invocations.lock().insert(id.clone(), Arc::clone(&entry));
        tracing::info!(invocation = %id, "invocation submitted");
        self.spawn_segment(&id, &entry, None);
        id
    }

    /// Replay-then-follow view of the invocation's events from the start.
    /// No gaps, no duplicates, regardless of when the caller subscribes.
    pub fn stream(&self, id: &str) -> Result<EventStream, RunnerError> {
        let entry = self.entry(id)?;
        Ok(Self::stream_from(&entry, 0))
    }

    /// Request cooperative cancellation. In-flight children finish their
    /// current step; composites observe the signal at child boundaries.
    pub fn cancel(&self, id: &str) -> Result<(), RunnerError> {
        let entry = self.entry(id)?;
        tracing::info!(invocation = %id, "cancellation requested");
        entry.cancel.cancel();
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<InvocationStatus, RunnerError> {
        Ok(*self.entry(id)?.status.lock())
    }

    /// Current flat state and full event log, at any point in the lifecycle.
    pub fn snapshot(&self, id: &str) -> Result<InvocationSnapshot, RunnerError> {
        let entry = self.entry(id)?;
        Ok(InvocationSnapshot {
            invocation_id: id.to_string(),
            status: *entry.status.lock(),
            state: entry.store.lock().snapshot(),
            events: entry.log.lock().clone(),
        })
    }

    /// Wait for the current run segment to finish and return the status.
    pub async fn join(&self, id: &str) -> Result<InvocationStatus, RunnerError> {
        let handle = self.entry(id)?.join.lock().take();
        if let Some(handle) = handle {
            handle.await.map_err(|err| RunnerError::JoinFailed {
                id: id.to_string(),
                message: err.to_string(),
            })?;
        }
        self.status(id)
    }

    /// Wake a suspended invocation. The payload lands in the store under
    /// `resume:{correlation_id}` for the suspended leaf to read; composites
    /// fast-forward to the suspended branch. Returns a stream starting at
    /// the resume point.
    #[instrument(skip(self, payload), fields(invocation = %id))]
    pub fn resume(
        &self,
        id: &str,
        correlation_id: &str,
        payload: Value,
    ) -> Result<EventStream, RunnerError> {
        let entry = self.entry(id)?;

        let suspension = {
            let mut slot = entry.suspension.lock();
            match slot.take() {
                None => {
                    return Err(RunnerError::NotSuspended { id: id.to_string() });
                }
                Some(suspension) if suspension.correlation_id != correlation_id => {
                    *slot = Some(suspension);
                    return Err(RunnerError::CorrelationMismatch {
                        id: id.to_string(),
                        correlation_id: correlation_id.to_string(),
                    });
                }
                Some(suspension) => suspension,
            }
        };

        entry.store.lock().insert(
            format!("resume:{correlation_id}"),
            payload,
            &suspension.branch,
        );
        *entry.status.lock() = InvocationStatus::Running;
        let resume_from = entry.log.lock().len();
        let cursor = Arc::new(ResumeCursor {
            branch: suspension.branch,
        });
        self.spawn_segment(id, &entry, Some(cursor));
        Ok(Self::stream_from(&entry, resume_from))
    }

    fn spawn_segment(
        &self,
        id: &str,
        entry: &Arc<InvocationEntry>,
        resume: Option<Arc<ResumeCursor>>,
    ) {
        let hub = EventHub::new(self.config.event_buffer_capacity);
        *entry.hub.lock() = Arc::downgrade(&hub);
        let emitter = InvocationEmitter::new(
            Arc::clone(&hub),
            Arc::clone(&entry.log),
            Arc::clone(&entry.sinks),
        );
        let mut ctx = ExecutionContext::root(
            id,
            entry.root.name(),
            Arc::clone(&entry.store),
            emitter.clone(),
            entry.cancel.clone(),
            entry.deadline,
            resume,
        );

        let id = id.to_string();
        let task_entry = Arc::clone(entry);
        let archive = self.archive.clone();
        let handle = tokio::spawn(async move {
            let root = Arc::clone(&task_entry.root);
            let outcome = root.invoke(&mut ctx).await;
            drop(ctx);
            Self::finalize(&id, &task_entry, &emitter, outcome, archive.as_deref()).await;
            // emitter (the last hub reference) drops here, ending every
            // stream following this segment.
        });
        *entry.join.lock() = Some(handle);
    }

    async fn finalize(
        id: &str,
        entry: &Arc<InvocationEntry>,
        emitter: &InvocationEmitter,
        outcome: BranchOutcome,
        archive: Option<&dyn SnapshotStore>,
    ) {
        let status = InvocationStatus::from_terminal(&outcome.terminal);
        if let TerminalKind::Suspended { correlation_id } = &outcome.terminal {
            *entry.suspension.lock() = Some(Suspension {
                correlation_id: correlation_id.clone(),
                branch: outcome.branch.clone(),
            });
        } else {
            entry.store.lock().drop_all_temp();
        }
        *entry.status.lock() = status;

        let mut terminal_event = Event::terminal(outcome.author.clone(), outcome.terminal.clone());
        terminal_event.branch = outcome.branch.clone();
        emitter.emit(terminal_event);
        tracing::info!(
            invocation = %id,
            status = outcome.terminal.label(),
            "invocation segment finished"
        );

        if status.is_final()
            && let Some(archive) = archive
        {
            let snapshot = InvocationSnapshot {
                invocation_id: id.to_string(),
                status,
                state: entry.store.lock().snapshot(),
                events: entry.log.lock().clone(),
            };
            if let Err(err) = archive.save(snapshot).await {
                tracing::error!(invocation = %id, error = %err, "archive save failed");
            }
        }
    }

    fn stream_from(entry: &Arc<InvocationEntry>, from: usize) -> EventStream {
        // Subscribe before snapshotting the log; anything emitted in
        // between shows up in both and is deduplicated by sequence number.
        let hub = entry.hub.lock().upgrade();
        let receiver = hub.as_ref().map(|hub| hub.subscribe_raw());
        let backlog: VecDeque<Envelope> = entry
            .log
            .lock()
            .iter()
            .cloned()
            .enumerate()
            .skip(from)
            .map(|(seq, event)| Envelope {
                seq: seq as u64,
                event,
            })
            .collect();
        EventStream::replay_then_follow(backlog, receiver, hub)
    }

    fn entry(&self, id: &str) -> Result<Arc<InvocationEntry>, RunnerError> {
        self.invocations
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownInvocation { id: id.to_string() })
    }
}
