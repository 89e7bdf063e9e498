use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

use crate::error::CallFailure;
use crate::interface::{MethodKey, MethodSig};
use crate::params::{CallMode, ThreadingPolicy};
use crate::registry::{ExportEntry, ExportRegistry};
use crate::service::{InvokeRequest, ServiceFault};
use crate::status::{InFlightGuard, ServerMetrics, ServerState, StateCell};

/// One decoded inbound call, as handed over by the transport/codec layer.
#[derive(Debug, Clone)]
pub struct CallDescriptor {
    pub rpc_id: Option<String>,
    pub interface: String,
    pub method: String,
    pub param_types: Vec<String>,
    /// Argument payloads, opaque to the dispatch core.
    pub args: Vec<Bytes>,
}

impl CallDescriptor {
    pub fn new(
        interface: impl Into<String>,
        method: impl Into<String>,
        param_types: impl IntoIterator<Item = impl Into<String>>,
        args: impl IntoIterator<Item = Bytes>,
    ) -> Self {
        Self {
            rpc_id: None,
            interface: interface.into(),
            method: method.into(),
            param_types: param_types.into_iter().map(Into::into).collect(),
            args: args.into_iter().collect(),
        }
    }

    /// Scope the call to an explicit rpc id.
    pub fn with_rpc_id(mut self, rpc_id: impl Into<String>) -> Self {
        self.rpc_id = Some(rpc_id.into());
        self
    }
}

/// The outcome of one dispatched call: an encoded return value, or a typed
/// failure. Never a panic across the dispatcher boundary.
pub type CallResult = Result<Bytes, CallFailure>;

/// Reply from [`Dispatcher::dispatch`].
#[derive(Debug)]
pub enum CallReply {
    /// Sync-mode calls complete inline.
    Done(CallResult),
    /// Async-mode calls return immediately; the result arrives on the handle.
    Pending(CorrelationHandle),
}

impl CallReply {
    /// Resolve to the final result, waiting for async-mode delivery.
    pub async fn into_result(self) -> CallResult {
        match self {
            CallReply::Done(result) => result,
            CallReply::Pending(handle) => handle.wait().await,
        }
    }
}

/// Identifies one async-mode call and carries its out-of-band result.
///
/// Results are paired to their handle by a dedicated channel, so no result
/// can ever be delivered to the wrong correlation handle. There is no
/// cross-call ordering guarantee.
#[derive(Debug)]
pub struct CorrelationHandle {
    call_id: u64,
    rx: oneshot::Receiver<CallResult>,
}

impl CorrelationHandle {
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Wait for the out-of-band result of this call.
    pub async fn wait(self) -> CallResult {
        match self.rx.await {
            Ok(result) => result,
            // The invocation task was torn down before it could deliver,
            // which only happens on server shutdown.
            Err(_) => Err(CallFailure::ServerClosed),
        }
    }
}

/// Resolves inbound call descriptors against the export registry and invokes
/// the bound implementor, translating every outcome into a typed result.
///
/// Cheap to clone; the transport holds one per connection handler if it
/// likes.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ExportRegistry>,
    metrics: Arc<ServerMetrics>,
    state: Arc<StateCell>,
    shutdown: CancellationToken,
    next_call_id: Arc<AtomicU64>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<ExportRegistry>,
        metrics: Arc<ServerMetrics>,
        state: Arc<StateCell>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            metrics,
            state,
            shutdown,
            next_call_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Dispatch one call.
    ///
    /// Resolution failures never touch an implementor, and call failures
    /// never unregister an entry: a transient call error must not corrupt
    /// registry state.
    pub async fn dispatch(&self, call: CallDescriptor) -> CallReply {
        self.metrics.record_dispatched();

        if self.state.get() != ServerState::Open {
            self.metrics.record_outcome(false);
            return CallReply::Done(Err(CallFailure::ServerClosed));
        }

        let entry = match self.registry.resolve(
            call.rpc_id.as_deref(),
            &call.interface,
            &call.method,
            &call.param_types,
        ) {
            Some(entry) => entry,
            None => {
                debug!(
                    interface = %call.interface,
                    method = %call.method,
                    rpc_id = ?call.rpc_id,
                    "no export for call"
                );
                self.metrics.record_outcome(false);
                let key = MethodKey::new(
                    call.interface,
                    MethodSig::new(call.method, call.param_types),
                );
                return CallReply::Done(Err(CallFailure::NoSuchExport {
                    key,
                    rpc_id: call.rpc_id,
                }));
            }
        };

        let guard = self.metrics.begin_call();

        match entry.options.call_mode {
            CallMode::Sync => {
                let result = Self::invoke(entry, call, self.shutdown.clone(), guard).await;
                self.metrics.record_outcome(result.is_ok());
                CallReply::Done(result)
            }
            CallMode::Async => {
                let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                let shutdown = self.shutdown.clone();
                let metrics = Arc::clone(&self.metrics);
                tokio::spawn(async move {
                    let result = Self::invoke(entry, call, shutdown, guard).await;
                    metrics.record_outcome(result.is_ok());
                    // A dropped receiver means the transport abandoned the
                    // handle; there is nobody left to deliver to.
                    let _ = tx.send(result);
                });
                CallReply::Pending(CorrelationHandle { call_id, rx })
            }
        }
    }

    /// Run one resolved invocation to completion under the entry's
    /// behavioral parameters.
    async fn invoke(
        entry: Arc<ExportEntry>,
        call: CallDescriptor,
        shutdown: CancellationToken,
        guard: InFlightGuard,
    ) -> CallResult {
        // The gauge unit is held for the full invocation, including the
        // timeout and cancellation paths.
        let _guard = guard;

        let budget = entry.options.invocation_timeout;
        let request = InvokeRequest {
            method: MethodSig::new(call.method, call.param_types),
            args: call.args,
        };

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(interface = %entry.interface, "call cancelled by shutdown");
                return Err(CallFailure::ServerClosed);
            }
            outcome = timeout(budget, Self::run_isolated(&entry, request)) => outcome,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(fault)) => {
                warn!(interface = %entry.interface, %fault, "implementor fault");
                Err(CallFailure::Application(fault))
            }
            Err(_) => {
                warn!(interface = %entry.interface, ?budget, "invocation exceeded budget");
                Err(CallFailure::InvocationTimeout { budget })
            }
        }
    }

    /// Invoke the implementor under the entry's threading policy and
    /// concurrency ceiling, converting panics into application faults so a
    /// faulty call cannot take down the dispatcher.
    async fn run_isolated(
        entry: &Arc<ExportEntry>,
        request: InvokeRequest,
    ) -> Result<Bytes, ServiceFault> {
        let _permit = match entry.limiter() {
            Some(limiter) => Some(
                Arc::clone(limiter)
                    .acquire_owned()
                    .await
                    .map_err(|_| ServiceFault::new("concurrency limiter closed"))?,
            ),
            None => None,
        };

        match entry.options.threading {
            ThreadingPolicy::Caller => {
                match AssertUnwindSafe(entry.service().invoke(request))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ServiceFault::new("implementor panicked")),
                }
            }
            ThreadingPolicy::Worker => {
                // Abort-on-drop so an invocation past its budget does not
                // keep running detached.
                let handle = AbortOnDropHandle::new(tokio::spawn(entry.service().invoke(request)));
                match handle.await {
                    Ok(result) => result,
                    Err(join) if join.is_panic() => Err(ServiceFault::new("implementor panicked")),
                    Err(_) => Err(ServiceFault::new("invocation task cancelled")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::InterfaceDef;
    use crate::params::CallOptions;
    use crate::service::{FnService, RpcService};
    use std::time::Duration;

    fn encode_i32(v: i32) -> Bytes {
        Bytes::copy_from_slice(&v.to_le_bytes())
    }

    fn decode_i32(b: &Bytes) -> i32 {
        i32::from_le_bytes(b.as_ref().try_into().unwrap())
    }

    fn calc_iface() -> InterfaceDef {
        InterfaceDef::new("calc.Calculator").method(MethodSig::new("add", ["i32", "i32"]))
    }

    fn adder() -> Arc<dyn RpcService> {
        Arc::new(
            FnService::new().method(MethodSig::new("add", ["i32", "i32"]), |args| async move {
                Ok(encode_i32(decode_i32(&args[0]) + decode_i32(&args[1])))
            }),
        )
    }

    fn open_dispatcher(registry: Arc<ExportRegistry>) -> (Dispatcher, Arc<ServerMetrics>) {
        let metrics = Arc::new(ServerMetrics::new());
        let state = Arc::new(StateCell::new());
        state.try_open();
        let dispatcher = Dispatcher::new(
            registry,
            Arc::clone(&metrics),
            state,
            CancellationToken::new(),
        );
        (dispatcher, metrics)
    }

    fn add_call(a: i32, b: i32) -> CallDescriptor {
        CallDescriptor::new(
            "calc.Calculator",
            "add",
            ["i32", "i32"],
            [encode_i32(a), encode_i32(b)],
        )
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let registry = Arc::new(ExportRegistry::new());
        registry
            .export_all(None, &calc_iface(), adder(), CallOptions::default())
            .unwrap();
        let (dispatcher, metrics) = open_dispatcher(registry);

        let result = dispatcher.dispatch(add_call(2, 3)).await.into_result().await;
        assert_eq!(decode_i32(&result.unwrap()), 5);
        assert_eq!(metrics.live_calls(), 0);
        assert_eq!(metrics.succeeded(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_export() {
        let registry = Arc::new(ExportRegistry::new());
        let (dispatcher, metrics) = open_dispatcher(registry);

        let failure = dispatcher
            .dispatch(add_call(2, 3))
            .await
            .into_result()
            .await
            .unwrap_err();
        assert!(matches!(failure, CallFailure::NoSuchExport { .. }));
        assert_eq!(metrics.failed(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_after_unexport() {
        let registry = Arc::new(ExportRegistry::new());
        registry
            .export_all(None, &calc_iface(), adder(), CallOptions::default())
            .unwrap();
        let (dispatcher, _metrics) = open_dispatcher(Arc::clone(&registry));

        let result = dispatcher.dispatch(add_call(2, 3)).await.into_result().await;
        assert_eq!(decode_i32(&result.unwrap()), 5);

        registry.unexport_all(None, "calc.Calculator");

        let failure = dispatcher
            .dispatch(add_call(2, 3))
            .await
            .into_result()
            .await
            .unwrap_err();
        assert!(matches!(failure, CallFailure::NoSuchExport { .. }));
    }

    #[tokio::test]
    async fn test_rpc_id_scoping_never_crosses_tenants() {
        let registry = Arc::new(ExportRegistry::new());
        let tenant_a: Arc<dyn RpcService> = Arc::new(FnService::new().method(
            MethodSig::new("add", ["i32", "i32"]),
            |_| async { Ok(encode_i32(1)) },
        ));
        let tenant_b: Arc<dyn RpcService> = Arc::new(FnService::new().method(
            MethodSig::new("add", ["i32", "i32"]),
            |_| async { Ok(encode_i32(2)) },
        ));
        registry
            .export_all(Some("tenantA"), &calc_iface(), tenant_a, CallOptions::default())
            .unwrap();
        registry
            .export_all(Some("tenantB"), &calc_iface(), tenant_b, CallOptions::default())
            .unwrap();
        let (dispatcher, _metrics) = open_dispatcher(registry);

        let a = dispatcher
            .dispatch(add_call(0, 0).with_rpc_id("tenantA"))
            .await
            .into_result()
            .await
            .unwrap();
        assert_eq!(decode_i32(&a), 1);

        let b = dispatcher
            .dispatch(add_call(0, 0).with_rpc_id("tenantB"))
            .await
            .into_result()
            .await
            .unwrap();
        assert_eq!(decode_i32(&b), 2);

        // No id-scoped entry for "tenantC" and no fallback to any other.
        let missing = dispatcher
            .dispatch(add_call(0, 0).with_rpc_id("tenantC"))
            .await
            .into_result()
            .await
            .unwrap_err();
        assert!(matches!(missing, CallFailure::NoSuchExport { .. }));
    }

    #[tokio::test]
    async fn test_application_fault_is_isolated() {
        let registry = Arc::new(ExportRegistry::new());
        let faulty: Arc<dyn RpcService> =
            Arc::new(FnService::new().method(
                MethodSig::new("add", ["i32", "i32"]),
                |_| async { Err(ServiceFault::new("overflow").with_payload(&b"ctx"[..])) },
            ));
        registry
            .export_all(None, &calc_iface(), faulty, CallOptions::default())
            .unwrap();
        let (dispatcher, metrics) = open_dispatcher(Arc::clone(&registry));

        let failure = dispatcher
            .dispatch(add_call(2, 3))
            .await
            .into_result()
            .await
            .unwrap_err();
        match failure {
            CallFailure::Application(fault) => {
                assert_eq!(fault.message, "overflow");
                assert_eq!(fault.payload.as_deref(), Some(&b"ctx"[..]));
            }
            other => panic!("expected application fault, got {other:?}"),
        }

        // The entry is still registered and subsequent calls still dispatch.
        assert_eq!(registry.exported_methods(), 1);
        let again = dispatcher.dispatch(add_call(2, 3)).await.into_result().await;
        assert!(matches!(again, Err(CallFailure::Application(_))));
        assert_eq!(metrics.live_calls(), 0);
    }

    #[tokio::test]
    async fn test_panic_is_converted_to_application_fault() {
        let registry = Arc::new(ExportRegistry::new());
        let panicking: Arc<dyn RpcService> = Arc::new(FnService::new().method(
            MethodSig::new("add", ["i32", "i32"]),
            |_| async { panic!("boom") },
        ));
        registry
            .export_all(None, &calc_iface(), panicking, CallOptions::default())
            .unwrap();
        let (dispatcher, metrics) = open_dispatcher(registry);

        let failure = dispatcher
            .dispatch(add_call(2, 3))
            .await
            .into_result()
            .await
            .unwrap_err();
        assert!(matches!(failure, CallFailure::Application(_)));
        assert_eq!(metrics.live_calls(), 0);
    }

    #[tokio::test]
    async fn test_worker_panic_is_converted_to_application_fault() {
        let registry = Arc::new(ExportRegistry::new());
        let panicking: Arc<dyn RpcService> = Arc::new(FnService::new().method(
            MethodSig::new("add", ["i32", "i32"]),
            |_| async { panic!("boom") },
        ));
        registry
            .export_all(
                None,
                &calc_iface(),
                panicking,
                CallOptions::default().with_threading(ThreadingPolicy::Worker),
            )
            .unwrap();
        let (dispatcher, _metrics) = open_dispatcher(registry);

        let failure = dispatcher
            .dispatch(add_call(2, 3))
            .await
            .into_result()
            .await
            .unwrap_err();
        assert!(matches!(failure, CallFailure::Application(_)));
    }

    #[tokio::test]
    async fn test_timeout_returns_gauge_to_baseline() {
        let registry = Arc::new(ExportRegistry::new());
        let slow: Arc<dyn RpcService> =
            Arc::new(FnService::new().method(
                MethodSig::new("add", ["i32", "i32"]),
                |_| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Bytes::new())
                },
            ));
        registry
            .export_all(
                None,
                &calc_iface(),
                slow,
                CallOptions::default().with_invocation_timeout(Duration::from_millis(10)),
            )
            .unwrap();
        let (dispatcher, metrics) = open_dispatcher(registry);

        let failure = dispatcher
            .dispatch(add_call(2, 3))
            .await
            .into_result()
            .await
            .unwrap_err();
        assert!(matches!(
            failure,
            CallFailure::InvocationTimeout { budget } if budget == Duration::from_millis(10)
        ));
        // No leaked in-flight accounting.
        assert_eq!(metrics.live_calls(), 0);
    }

    #[tokio::test]
    async fn test_async_mode_returns_pending_with_correct_delivery() {
        let registry = Arc::new(ExportRegistry::new());
        registry
            .export_all(
                None,
                &calc_iface(),
                adder(),
                CallOptions::default().with_call_mode(CallMode::Async),
            )
            .unwrap();
        let (dispatcher, _metrics) = open_dispatcher(registry);

        let first = dispatcher.dispatch(add_call(2, 3)).await;
        let second = dispatcher.dispatch(add_call(10, 20)).await;

        let (first, second) = match (first, second) {
            (CallReply::Pending(a), CallReply::Pending(b)) => (a, b),
            other => panic!("expected pending replies, got {other:?}"),
        };
        assert_ne!(first.call_id(), second.call_id());

        // Await out of order; each handle still gets its own result.
        assert_eq!(decode_i32(&second.wait().await.unwrap()), 30);
        assert_eq!(decode_i32(&first.wait().await.unwrap()), 5);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_queues_calls() {
        let registry = Arc::new(ExportRegistry::new());
        let slow: Arc<dyn RpcService> =
            Arc::new(FnService::new().method(
                MethodSig::new("add", ["i32", "i32"]),
                |_| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(Bytes::new())
                },
            ));
        registry
            .export_all(
                None,
                &calc_iface(),
                slow,
                CallOptions::default()
                    .with_call_mode(CallMode::Async)
                    .with_max_in_flight(1),
            )
            .unwrap();
        let (dispatcher, _metrics) = open_dispatcher(registry);

        let started = tokio::time::Instant::now();
        let first = dispatcher.dispatch(add_call(0, 0)).await;
        let second = dispatcher.dispatch(add_call(0, 0)).await;

        assert!(first.into_result().await.is_ok());
        assert!(second.into_result().await.is_ok());
        // The second call had to wait for the first one's permit.
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_call() {
        let registry = Arc::new(ExportRegistry::new());
        let stuck: Arc<dyn RpcService> =
            Arc::new(FnService::new().method(
                MethodSig::new("add", ["i32", "i32"]),
                |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Bytes::new())
                },
            ));
        registry
            .export_all(
                None,
                &calc_iface(),
                stuck,
                CallOptions::default().with_invocation_timeout(Duration::from_secs(120)),
            )
            .unwrap();

        let metrics = Arc::new(ServerMetrics::new());
        let state = Arc::new(StateCell::new());
        state.try_open();
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            registry,
            Arc::clone(&metrics),
            state,
            shutdown.clone(),
        );

        let call = tokio::spawn(async move { dispatcher.dispatch(add_call(0, 0)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let reply = call.await.unwrap();
        assert!(matches!(
            reply.into_result().await,
            Err(CallFailure::ServerClosed)
        ));
        assert_eq!(metrics.live_calls(), 0);
    }
}
