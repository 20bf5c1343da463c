use std::time::Duration;

/// Runner-wide defaults. Per-invocation overrides go through
/// [`InvokeOptions`](super::InvokeOptions).
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Broadcast buffer per invocation; slow subscribers past this lag are
    /// accounted on the hub and recover via log replay.
    pub event_buffer_capacity: usize,
    /// Deadline applied to every invocation that does not set its own.
    pub default_deadline: Option<Duration>,
    /// Mirror every event to stdout (one display line each).
    pub stdout_events: bool,
}

impl RunnerConfig {
    pub const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 1024;

    #[must_use]
    pub fn with_event_buffer_capacity(mut self, capacity: usize) -> Self {
        self.event_buffer_capacity = if capacity == 0 {
            Self::DEFAULT_EVENT_BUFFER_CAPACITY
        } else {
            capacity
        };
        self
    }

    #[must_use]
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_stdout_events(mut self) -> Self {
        self.stdout_events = true;
        self
    }

    fn resolve_buffer_capacity() -> usize {
        dotenvy::dotenv().ok();
        std::env::var("BRANCHWORK_EVENT_BUFFER")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .filter(|&capacity| capacity > 0)
            .unwrap_or(Self::DEFAULT_EVENT_BUFFER_CAPACITY)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            event_buffer_capacity: Self::resolve_buffer_capacity(),
            default_deadline: None,
            stdout_events: false,
        }
    }
}
