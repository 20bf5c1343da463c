//! Event model and plumbing: the event record itself, the per-invocation
//! broadcast hub with replay-then-follow streams, the emitter that keeps the
//! log and the live feed in lockstep, and pluggable sinks.

mod emitter;
mod event;
mod hub;
mod sink;

pub use emitter::InvocationEmitter;
pub use event::{Event, EventActions, EventPayload, FailureDetail, TerminalKind};
pub use hub::{BlockingEventIter, EventHub, EventStream};
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};

pub(crate) use hub::Envelope;
