//! Shared behaviors and helpers for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use branchwork::prelude::*;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

pub fn initial(pairs: &[(&str, Value)]) -> FxHashMap<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

pub fn authors(events: &[Event]) -> Vec<String> {
    events.iter().map(|event| event.author.clone()).collect()
}

pub fn texts(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match &event.payload {
            EventPayload::Text(content) => Some(content.clone()),
            _ => None,
        })
        .collect()
}

pub fn terminal_of(events: &[Event]) -> TerminalKind {
    events
        .last()
        .and_then(|event| event.terminal_kind())
        .cloned()
        .expect("log should end with a terminal event")
}

/// Emits one text event that writes `key = value`.
pub struct SetValue {
    pub key: String,
    pub value: Value,
}

#[async_trait]
impl LeafBehavior for SetValue {
    async fn run(&self, ctx: &mut LeafContext<'_>) -> Result<LeafFinish, UnitError> {
        let event = Event::text(ctx.author().to_string(), format!("set {}", self.key))
            .with_state(self.key.clone(), self.value.clone());
        ctx.emit(event);
        Ok(LeafFinish::Completed)
    }
}

pub fn set_value(name: &str, key: &str, value: Value) -> Arc<dyn WorkUnit> {
    Arc::new(Leaf::new(
        name,
        SetValue {
            key: key.to_string(),
            value,
        },
    ))
}

/// Reads `from`, writes `to = from + 1`.
pub struct AddOne {
    pub from: String,
    pub to: String,
}

#[async_trait]
impl LeafBehavior for AddOne {
    async fn run(&self, ctx: &mut LeafContext<'_>) -> Result<LeafFinish, UnitError> {
        let current = ctx.require(&self.from)?;
        let n = current
            .as_i64()
            .ok_or_else(|| UnitError::child_failure(ctx.author(), "expected an integer"))?;
        let event = Event::text(ctx.author().to_string(), format!("{} -> {}", self.from, self.to))
            .with_state(self.to.clone(), json!(n + 1));
        ctx.emit(event);
        Ok(LeafFinish::Completed)
    }
}

/// Emits the given texts, one event each.
pub struct Say {
    pub messages: Vec<String>,
}

#[async_trait]
impl LeafBehavior for Say {
    async fn run(&self, ctx: &mut LeafContext<'_>) -> Result<LeafFinish, UnitError> {
        for message in &self.messages {
            ctx.emit_text(message.clone());
        }
        Ok(LeafFinish::Completed)
    }
}

pub fn say(name: &str, message: &str) -> Arc<dyn WorkUnit> {
    Arc::new(Leaf::new(
        name,
        Say {
            messages: vec![message.to_string()],
        },
    ))
}

pub fn say_many(name: &str, messages: &[&str]) -> Arc<dyn WorkUnit> {
    Arc::new(Leaf::new(
        name,
        Say {
            messages: messages.iter().map(|m| m.to_string()).collect(),
        },
    ))
}

/// Always fails.
pub struct Fail {
    pub message: String,
}

#[async_trait]
impl LeafBehavior for Fail {
    async fn run(&self, ctx: &mut LeafContext<'_>) -> Result<LeafFinish, UnitError> {
        Err(UnitError::child_failure(ctx.author(), &self.message))
    }
}

pub fn fail(name: &str, message: &str) -> Arc<dyn WorkUnit> {
    Arc::new(Leaf::new(
        name,
        Fail {
            message: message.to_string(),
        },
    ))
}

/// Sleeps, then emits one text event.
pub struct Sleeper {
    pub millis: u64,
}

#[async_trait]
impl LeafBehavior for Sleeper {
    async fn run(&self, ctx: &mut LeafContext<'_>) -> Result<LeafFinish, UnitError> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        ctx.emit_text("done sleeping");
        Ok(LeafFinish::Completed)
    }
}

pub fn sleeper(name: &str, millis: u64) -> Arc<dyn WorkUnit> {
    Arc::new(Leaf::new(name, Sleeper { millis }))
}

/// Sleeps a random few milliseconds, then writes `key = value`.
pub struct JitterWrite {
    pub key: String,
    pub value: Value,
}

#[async_trait]
impl LeafBehavior for JitterWrite {
    async fn run(&self, ctx: &mut LeafContext<'_>) -> Result<LeafFinish, UnitError> {
        let millis = {
            use rand::Rng;
            rand::rng().random_range(0..5u64)
        };
        tokio::time::sleep(Duration::from_millis(millis)).await;
        let event = Event::text(ctx.author().to_string(), format!("wrote {}", self.key))
            .with_state(self.key.clone(), self.value.clone());
        ctx.emit(event);
        Ok(LeafFinish::Completed)
    }
}

pub fn jitter_write(name: &str, key: &str, value: Value) -> Arc<dyn WorkUnit> {
    Arc::new(Leaf::new(
        name,
        JitterWrite {
            key: key.to_string(),
            value,
        },
    ))
}

/// Emits one escalating event.
pub struct Escalate;

#[async_trait]
impl LeafBehavior for Escalate {
    async fn run(&self, ctx: &mut LeafContext<'_>) -> Result<LeafFinish, UnitError> {
        let event = Event::text(ctx.author().to_string(), "escalating").with_escalate();
        ctx.emit(event);
        Ok(LeafFinish::Completed)
    }
}

pub fn escalate(name: &str) -> Arc<dyn WorkUnit> {
    Arc::new(Leaf::new(name, Escalate))
}

/// Emits one event that requests a transfer to a named sibling.
pub struct TransferTo {
    pub target: String,
}

#[async_trait]
impl LeafBehavior for TransferTo {
    async fn run(&self, ctx: &mut LeafContext<'_>) -> Result<LeafFinish, UnitError> {
        let event = Event::text(ctx.author().to_string(), format!("jump to {}", self.target))
            .with_transfer_to(self.target.clone());
        ctx.emit(event);
        Ok(LeafFinish::Completed)
    }
}

pub fn transfer_to(name: &str, target: &str) -> Arc<dyn WorkUnit> {
    Arc::new(Leaf::new(
        name,
        TransferTo {
            target: target.to_string(),
        },
    ))
}

/// Suspends until resumed, then records the resume payload.
pub struct ApprovalGate {
    pub correlation_id: String,
}

#[async_trait]
impl LeafBehavior for ApprovalGate {
    async fn run(&self, ctx: &mut LeafContext<'_>) -> Result<LeafFinish, UnitError> {
        match ctx.resume_payload(&self.correlation_id) {
            Some(payload) => {
                let event = Event::text(ctx.author().to_string(), "approval received")
                    .with_state("approval", payload);
                ctx.emit(event);
                Ok(LeafFinish::Completed)
            }
            None => Ok(LeafFinish::Suspended {
                correlation_id: self.correlation_id.clone(),
            }),
        }
    }
}

pub fn approval_gate(name: &str, correlation_id: &str) -> Arc<dyn WorkUnit> {
    Arc::new(Leaf::new(
        name,
        ApprovalGate {
            correlation_id: correlation_id.to_string(),
        },
    ))
}

/// Model collaborator that echoes the prompt.
pub struct EchoModel;

#[async_trait]
impl ModelInvoker for EchoModel {
    async fn call(
        &self,
        request: ModelRequest,
        _ctx: &CallContext,
    ) -> Result<Event, CollaboratorError> {
        Ok(Event::text("model", format!("echo: {}", request.prompt)))
    }
}

/// Tool collaborator that reflects its arguments back.
pub struct EchoTool;

#[async_trait]
impl ToolInvoker for EchoTool {
    async fn call(
        &self,
        name: &str,
        args: Value,
        _ctx: &CallContext,
    ) -> Result<Event, CollaboratorError> {
        Ok(Event::function_response("tool", name, args))
    }
}
