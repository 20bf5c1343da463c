use std::fmt;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::branch::BranchPath;

/// Immutable record of one observable step of an invocation.
///
/// Events are the only channel through which units publish output and mutate
/// shared state: the `state_delta` on [`EventActions`] is applied exactly
/// once, at emission, to the emitting context's store. The ordered event log
/// is therefore a complete audit of every state mutation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique event id (uuid v4).
    pub id: String,
    /// Name of the emitting unit (or collaborator on its behalf).
    pub author: String,
    /// Branch path of the emitting context. Stamped at emission.
    pub branch: BranchPath,
    pub when: DateTime<Utc>,
    pub payload: EventPayload,
    pub actions: EventActions,
}

/// What an event carries.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum EventPayload {
    /// Plain output text.
    Text(String),
    /// Intermediate structured output (e.g. a streamed model chunk).
    PartialResult(Value),
    /// A collaborator call about to be made.
    FunctionCall { name: String, args: Value },
    /// A collaborator call's result.
    FunctionResponse { name: String, value: Value },
    /// Stream terminator. Emitted once per run segment, by the runner only.
    Terminal(TerminalKind),
}

/// Control signals riding on an event.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EventActions {
    /// Keys to write into the emitting context's store at emission.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub state_delta: FxHashMap<String, Value>,
    /// Ask enclosing composites to stop early.
    #[serde(default)]
    pub escalate: bool,
    /// Ask the enclosing Sequential to jump forward to a named sibling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to: Option<String>,
    /// Skip the after-callbacks of the boundary that produced this event.
    #[serde(default)]
    pub suppress_downstream: bool,
}

/// How an invocation (or one run segment of it) ended.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum TerminalKind {
    Completed,
    Cancelled,
    Failed { failures: Vec<FailureDetail> },
    DeadlineExceeded,
    /// Parked awaiting external input; resumable via the correlation id.
    Suspended { correlation_id: String },
}

impl TerminalKind {
    pub fn label(&self) -> &'static str {
        match self {
            TerminalKind::Completed => "completed",
            TerminalKind::Cancelled => "cancelled",
            TerminalKind::Failed { .. } => "failed",
            TerminalKind::DeadlineExceeded => "deadline_exceeded",
            TerminalKind::Suspended { .. } => "suspended",
        }
    }

    /// Anything but `Completed` aborts enclosing composites.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TerminalKind::Completed)
    }
}

/// One failed unit inside a `Failed` terminal. Parallel joins report the
/// full set; everything else reports a single entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FailureDetail {
    pub unit: String,
    pub branch: BranchPath,
    pub message: String,
}

impl Event {
    fn new(author: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            author: author.into(),
            branch: BranchPath::default(),
            when: Utc::now(),
            payload,
            actions: EventActions::default(),
        }
    }

    pub fn text(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(author, EventPayload::Text(content.into()))
    }

    pub fn partial(author: impl Into<String>, value: Value) -> Self {
        Self::new(author, EventPayload::PartialResult(value))
    }

    pub fn function_call(author: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self::new(
            author,
            EventPayload::FunctionCall {
                name: name.into(),
                args,
            },
        )
    }

    pub fn function_response(
        author: impl Into<String>,
        name: impl Into<String>,
        value: Value,
    ) -> Self {
        Self::new(
            author,
            EventPayload::FunctionResponse {
                name: name.into(),
                value,
            },
        )
    }

    pub fn terminal(author: impl Into<String>, kind: TerminalKind) -> Self {
        Self::new(author, EventPayload::Terminal(kind))
    }

    #[must_use]
    pub fn with_delta(mut self, delta: FxHashMap<String, Value>) -> Self {
        self.actions.state_delta = delta;
        self
    }

    /// Convenience for single-key deltas.
    #[must_use]
    pub fn with_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.actions.state_delta.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_escalate(mut self) -> Self {
        self.actions.escalate = true;
        self
    }

    #[must_use]
    pub fn with_transfer_to(mut self, target: impl Into<String>) -> Self {
        self.actions.transfer_to = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_suppress_downstream(mut self) -> Self {
        self.actions.suppress_downstream = true;
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.payload, EventPayload::Terminal(_))
    }

    pub fn terminal_kind(&self) -> Option<&TerminalKind> {
        match &self.payload {
            EventPayload::Terminal(kind) => Some(kind),
            _ => None,
        }
    }

    /// Convert to a normalized JSON object for sinks and archives.
    pub fn to_json_value(&self) -> Value {
        use serde_json::json;

        let (kind, body) = match &self.payload {
            EventPayload::Text(text) => ("text", json!({ "content": text })),
            EventPayload::PartialResult(value) => ("partial", json!({ "value": value })),
            EventPayload::FunctionCall { name, args } => {
                ("function_call", json!({ "name": name, "args": args }))
            }
            EventPayload::FunctionResponse { name, value } => {
                ("function_response", json!({ "name": name, "value": value }))
            }
            EventPayload::Terminal(terminal) => ("terminal", json!({ "kind": terminal.label() })),
        };

        json!({
            "id": self.id,
            "type": kind,
            "author": self.author,
            "branch": self.branch.to_string(),
            "timestamp": self.when.to_rfc3339(),
            "body": body,
            "actions": {
                "state_delta": self.actions.state_delta,
                "escalate": self.actions.escalate,
                "transfer_to": self.actions.transfer_to,
                "suppress_downstream": self.actions.suppress_downstream,
            },
        })
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            EventPayload::Text(text) => write!(f, "[{}] {text}", self.author),
            EventPayload::PartialResult(value) => write!(f, "[{}] partial {value}", self.author),
            EventPayload::FunctionCall { name, .. } => {
                write!(f, "[{}] call {name}", self.author)
            }
            EventPayload::FunctionResponse { name, .. } => {
                write!(f, "[{}] response {name}", self.author)
            }
            EventPayload::Terminal(terminal) => {
                write!(f, "[{}] terminal {}", self.author, terminal.label())
            }
        }
    }
}
