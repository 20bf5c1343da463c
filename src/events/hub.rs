use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::stream;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tokio::time::timeout;

use super::event::Event;

/// An event stamped with its position in the invocation log.
///
/// The sequence number is the event's index in the log, assigned under the
/// same lock that appends it, so replaying the log and then following the
/// hub can be stitched together without gaps or duplicates.
#[derive(Clone, Debug)]
pub(crate) struct Envelope {
    pub(crate) seq: u64,
    pub(crate) event: Event,
}

/// Broadcast fan-out for one invocation's live events.
#[derive(Debug)]
pub struct EventHub {
    sender: Sender<Envelope>,
    dropped_events: AtomicUsize,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self {
            sender,
            dropped_events: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Fan out to live subscribers. No subscribers is not an error; the
    /// event is already in the log and reachable by replay.
    pub(crate) fn publish(&self, envelope: Envelope) {
        let _ = self.sender.send(envelope);
    }

    pub(crate) fn subscribe_raw(&self) -> Receiver<Envelope> {
        self.sender.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events dropped by slow subscribers since creation.
    pub fn dropped(&self) -> usize {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn record_lag(&self, missed: u64) {
        self.dropped_events
            .fetch_add(missed as usize, Ordering::Relaxed);
    }
}

/// Ordered view of one invocation's events: a replayed backlog of everything
/// already logged, then live events from the hub, deduplicated by sequence
/// number. Ends (`None`) when the run segment's emitter is dropped and the
/// backlog is drained.
#[derive(Debug)]
pub struct EventStream {
    backlog: VecDeque<Envelope>,
    receiver: Option<Receiver<Envelope>>,
    hub: Option<Arc<EventHub>>,
    last_seq: Option<u64>,
}

impl EventStream {
    pub(crate) fn replay_then_follow(
        backlog: VecDeque<Envelope>,
        receiver: Option<Receiver<Envelope>>,
        hub: Option<Arc<EventHub>>,
    ) -> Self {
        Self {
            backlog,
            receiver,
            hub,
            last_seq: None,
        }
    }

    /// Next event, or `None` once the stream is exhausted.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(envelope) = self.backlog.pop_front() {
            self.last_seq = Some(envelope.seq);
            return Some(envelope.event);
        }
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(envelope) => {
                    if self.already_seen(envelope.seq) {
                        continue;
                    }
                    self.last_seq = Some(envelope.seq);
                    return Some(envelope.event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    if let Some(hub) = &self.hub {
                        hub.record_lag(missed);
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Next event within `duration`, or `None` on timeout or stream end.
    pub async fn next_timeout(&mut self, duration: Duration) -> Option<Event> {
        if let Some(envelope) = self.backlog.pop_front() {
            self.last_seq = Some(envelope.seq);
            return Some(envelope.event);
        }
        match timeout(duration, self.recv()).await {
            Ok(event) => event,
            Err(_) => None,
        }
    }

    /// Drain everything up to and including the first terminal event.
    pub async fn collect_segment(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    pub fn into_blocking_iter(self) -> BlockingEventIter {
        BlockingEventIter { stream: self }
    }

    pub fn into_async_stream(self) -> impl futures_util::stream::Stream<Item = Event> {
        stream::unfold(self, |mut stream| async move {
            stream.recv().await.map(|event| (event, stream))
        })
    }

    fn already_seen(&self, seq: u64) -> bool {
        self.last_seq.is_some_and(|last| seq <= last)
    }
}

/// Blocking adapter for consuming events outside async code.
pub struct BlockingEventIter {
    stream: EventStream,
}

impl Iterator for BlockingEventIter {
    type Item = Event;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(envelope) = self.stream.backlog.pop_front() {
            self.stream.last_seq = Some(envelope.seq);
            return Some(envelope.event);
        }
        loop {
            let receiver = self.stream.receiver.as_mut()?;
            match receiver.blocking_recv() {
                Ok(envelope) => {
                    if self.stream.already_seen(envelope.seq) {
                        continue;
                    }
                    self.stream.last_seq = Some(envelope.seq);
                    return Some(envelope.event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    if let Some(hub) = &self.stream.hub {
                        hub.record_lag(missed);
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.stream.receiver = None;
                    return None;
                }
            }
        }
    }
}
