use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::event::Event;
use super::hub::{Envelope, EventHub};
use super::sink::EventSink;

/// Cloneable handle that appends events to the invocation log and fans them
/// out to sinks and live subscribers.
///
/// The log append, sink dispatch, and hub publish all happen under one lock,
/// so the sequence number a subscriber sees is exactly the event's index in
/// the log even when parallel branches emit concurrently.
#[derive(Clone)]
pub struct InvocationEmitter {
    hub: Arc<EventHub>,
    log: Arc<Mutex<Vec<Event>>>,
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
}

impl InvocationEmitter {
    pub(crate) fn new(
        hub: Arc<EventHub>,
        log: Arc<Mutex<Vec<Event>>>,
        sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    ) -> Self {
        Self { hub, log, sinks }
    }

    /// Emit one event; returns its sequence number in the log.
    pub fn emit(&self, event: Event) -> u64 {
        let mut log = self.log.lock();
        let seq = log.len() as u64;
        log.push(event.clone());

        {
            let mut sinks = self.sinks.lock();
            for sink in sinks.iter_mut() {
                if let Err(err) = sink.handle(&event) {
                    tracing::debug!(error = %err, "event sink failed");
                }
            }
        }

        self.hub.publish(Envelope { seq, event });
        seq
    }
}

impl fmt::Debug for InvocationEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationEmitter")
            .field("hub", &self.hub)
            .field("logged", &self.log.lock().len())
            .finish_non_exhaustive()
    }
}
