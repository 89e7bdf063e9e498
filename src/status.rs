use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use tokio::sync::Notify;

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Open,
    Closed,
}

/// Atomic cell holding the lifecycle state.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    const CREATED: u8 = 0;
    const OPEN: u8 = 1;
    const CLOSED: u8 = 2;

    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(Self::CREATED))
    }

    pub(crate) fn get(&self) -> ServerState {
        match self.0.load(Ordering::Acquire) {
            Self::CREATED => ServerState::Created,
            Self::OPEN => ServerState::Open,
            _ => ServerState::Closed,
        }
    }

    /// `Created -> Open`. Returns false from any other state.
    pub(crate) fn try_open(&self) -> bool {
        self.0
            .compare_exchange(
                Self::CREATED,
                Self::OPEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Transition to `Closed`. Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        self.0.swap(Self::CLOSED, Ordering::AcqRel) != Self::CLOSED
    }
}

/// Invocation counters, updated in step with dispatch so status readers never
/// observe accounting that disagrees with what the dispatcher did.
#[derive(Debug)]
pub(crate) struct ServerMetrics {
    live_calls: AtomicU64,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    idle: Notify,
}

impl ServerMetrics {
    pub(crate) fn new() -> Self {
        Self {
            live_calls: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            idle: Notify::new(),
        }
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, ok: bool) {
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Mark one call in flight. The returned guard keeps the gauge held
    /// until the call completes, however it completes.
    pub(crate) fn begin_call(self: &Arc<Self>) -> InFlightGuard {
        self.live_calls.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            metrics: Arc::clone(self),
        }
    }

    pub(crate) fn live_calls(&self) -> u64 {
        self.live_calls.load(Ordering::Acquire)
    }

    pub(crate) fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub(crate) fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Resolve once the live-call gauge reaches zero.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            if self.live_calls.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Holds one unit of the live-call gauge; dropping it releases the unit and
/// wakes drain waiters when the gauge hits zero.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    metrics: Arc<ServerMetrics>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.metrics.live_calls.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.metrics.idle.notify_waiters();
        }
    }
}

/// Read-only snapshot of the server for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStatus {
    pub state: ServerState,
    pub exported_methods: usize,
    pub live_calls: u64,
    pub calls_dispatched: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_state_cell_transitions() {
        let state = StateCell::new();
        assert_eq!(state.get(), ServerState::Created);

        assert!(state.try_open());
        assert_eq!(state.get(), ServerState::Open);
        // Second open is not a transition.
        assert!(!state.try_open());

        assert!(state.close());
        assert_eq!(state.get(), ServerState::Closed);
        assert!(!state.close());
        // Re-opening a closed server is not possible.
        assert!(!state.try_open());
        assert_eq!(state.get(), ServerState::Closed);
    }

    #[test]
    fn test_close_from_created() {
        let state = StateCell::new();
        assert!(state.close());
        assert_eq!(state.get(), ServerState::Closed);
    }

    #[tokio::test]
    async fn test_in_flight_guard_accounting() {
        let metrics = Arc::new(ServerMetrics::new());

        let a = metrics.begin_call();
        let b = metrics.begin_call();
        assert_eq!(metrics.live_calls(), 2);

        drop(a);
        assert_eq!(metrics.live_calls(), 1);
        drop(b);
        assert_eq!(metrics.live_calls(), 0);
    }

    #[tokio::test]
    async fn test_drained_wakes_on_last_guard() {
        let metrics = Arc::new(ServerMetrics::new());
        let guard = metrics.begin_call();

        let waiter = {
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move { metrics.drained().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain should complete once the gauge hits zero")
            .unwrap();
    }

    #[tokio::test]
    async fn test_drained_returns_immediately_when_idle() {
        let metrics = Arc::new(ServerMetrics::new());
        tokio::time::timeout(Duration::from_millis(100), metrics.drained())
            .await
            .expect("no live calls, drain is immediate");
    }
}
