use std::time::Duration;

/// How a dispatched call returns to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// The dispatcher awaits the invocation and returns the result inline.
    Sync,
    /// The dispatcher returns a correlation handle immediately; the result is
    /// delivered out-of-band when the invocation completes.
    Async,
}

/// Which execution context services an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingPolicy {
    /// Run on the dispatching task.
    Caller,
    /// Run on a spawned runtime task.
    Worker,
}

/// Per-export behavioral parameters.
///
/// Attached at export time, so different exports on the same server carry
/// independent timeout, mode, and threading behavior.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Maximum wall-clock duration before an invocation fails with a
    /// timeout. Covers queueing behind the concurrency ceiling as well.
    pub invocation_timeout: Duration,

    pub call_mode: CallMode,

    pub threading: ThreadingPolicy,

    /// Concurrency ceiling for calls through this export. `None` is
    /// unbounded.
    pub max_in_flight: Option<usize>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            invocation_timeout: Duration::from_secs(30),
            call_mode: CallMode::Sync,
            threading: ThreadingPolicy::Caller,
            max_in_flight: None,
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the invocation timeout budget.
    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    /// Set the call mode.
    pub fn with_call_mode(mut self, mode: CallMode) -> Self {
        self.call_mode = mode;
        self
    }

    /// Set the threading policy.
    pub fn with_threading(mut self, policy: ThreadingPolicy) -> Self {
        self.threading = policy;
        self
    }

    /// Bound the number of concurrent invocations through this export.
    pub fn with_max_in_flight(mut self, ceiling: usize) -> Self {
        self.max_in_flight = Some(ceiling);
        self
    }
}
