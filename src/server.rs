use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{ExportError, ServerError};
use crate::interface::InterfaceDef;
use crate::params::CallOptions;
use crate::registry::ExportRegistry;
use crate::service::RpcService;
use crate::status::{ServerMetrics, ServerState, ServerStatus, StateCell};

/// The transport seam: a network listener lifecycled by the server.
///
/// The wire protocol, framing, and connection acceptance all live behind
/// this trait; the core only opens and closes it.
pub trait Listener: Send + Sync {
    fn open(&self) -> BoxFuture<'_, Result<(), ServerError>>;
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Configuration for the server lifecycle.
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    /// How long `close()` waits for in-flight calls before cancelling them.
    pub drain_timeout: Duration,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl RpcServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the drain window for `close()`.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// The RPC server core: export registry, dispatcher, and lifecycle.
///
/// Construct, export implementors, `open()` once, and hand the
/// [`Dispatcher`] to the transport. `close()` stops new calls, drains
/// in-flight work, and releases every resource; both lifecycle calls are
/// idempotent.
///
/// Each server owns its registry outright, so multiple independent servers
/// can coexist in one process.
pub struct RpcServer {
    registry: Arc<ExportRegistry>,
    metrics: Arc<ServerMetrics>,
    state: Arc<StateCell>,
    shutdown: CancellationToken,
    listener: Option<Box<dyn Listener>>,
    config: RpcServerConfig,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig) -> Self {
        Self {
            registry: Arc::new(ExportRegistry::new()),
            metrics: Arc::new(ServerMetrics::new()),
            state: Arc::new(StateCell::new()),
            shutdown: CancellationToken::new(),
            listener: None,
            config,
        }
    }

    /// Attach the transport listener to be lifecycled by `open()`/`close()`.
    pub fn with_listener(mut self, listener: Box<dyn Listener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Open the server and start serving. Valid once, from `Created`;
    /// repeat calls are no-ops rather than errors.
    pub async fn open(&self) -> Result<(), ServerError> {
        if !self.state.try_open() {
            debug!(state = ?self.state.get(), "open() ignored");
            return Ok(());
        }

        if let Some(listener) = &self.listener {
            if let Err(e) = listener.open().await {
                // A server whose listener never came up cannot serve.
                self.state.close();
                return Err(e);
            }
        }

        info!("rpc server open");
        Ok(())
    }

    /// Close the server: stop accepting new calls, give in-flight calls the
    /// configured drain window, then cancel stragglers cooperatively and
    /// release listener and registry resources. Idempotent.
    pub async fn close(&self) {
        if !self.state.close() {
            debug!("close() ignored, already closed");
            return;
        }

        // New dispatches are rejected from this point on; wait for the
        // in-flight gauge to settle.
        let drained = tokio::time::timeout(self.config.drain_timeout, self.metrics.drained());
        if drained.await.is_err() {
            warn!(
                live = self.metrics.live_calls(),
                "drain window elapsed, cancelling in-flight calls"
            );
        }
        self.shutdown.cancel();

        if let Some(listener) = &self.listener {
            listener.close().await;
        }
        self.registry.clear();

        info!("rpc server closed");
    }

    /// Export every declared method of `iface` under the default scope.
    pub fn export(
        &self,
        iface: &InterfaceDef,
        service: Arc<dyn RpcService>,
        options: CallOptions,
    ) -> Result<(), ExportError> {
        self.guard_registration()?;
        self.registry.export_all(None, iface, service, options)?;
        Ok(())
    }

    /// Export every declared method of `iface` under an explicit rpc id,
    /// letting multiple implementors serve the same interface.
    pub fn export_with_id(
        &self,
        rpc_id: &str,
        iface: &InterfaceDef,
        service: Arc<dyn RpcService>,
        options: CallOptions,
    ) -> Result<(), ExportError> {
        self.guard_registration()?;
        self.registry
            .export_all(Some(rpc_id), iface, service, options)?;
        Ok(())
    }

    /// Export exactly one method signature under the default scope.
    pub fn export_method<S: AsRef<str>>(
        &self,
        iface: &InterfaceDef,
        method: &str,
        param_types: &[S],
        service: Arc<dyn RpcService>,
        options: CallOptions,
    ) -> Result<(), ExportError> {
        self.guard_registration()?;
        self.registry
            .export_method(None, iface, method, param_types, service, options)?;
        Ok(())
    }

    /// Export exactly one method signature under an explicit rpc id.
    pub fn export_method_with_id<S: AsRef<str>>(
        &self,
        rpc_id: &str,
        iface: &InterfaceDef,
        method: &str,
        param_types: &[S],
        service: Arc<dyn RpcService>,
        options: CallOptions,
    ) -> Result<(), ExportError> {
        self.guard_registration()?;
        self.registry
            .export_method(Some(rpc_id), iface, method, param_types, service, options)?;
        Ok(())
    }

    /// Remove every method registered for this interface in the default
    /// scope. A no-op if none are.
    pub fn unexport(&self, interface: &str) -> Result<(), ExportError> {
        self.guard_registration()?;
        self.registry.unexport_all(None, interface);
        Ok(())
    }

    /// Remove every method registered for this interface under the given
    /// rpc id.
    pub fn unexport_with_id(&self, rpc_id: &str, interface: &str) -> Result<(), ExportError> {
        self.guard_registration()?;
        self.registry.unexport_all(Some(rpc_id), interface);
        Ok(())
    }

    /// Remove one method signature from the default scope.
    pub fn unexport_method<S: AsRef<str>>(
        &self,
        interface: &str,
        method: &str,
        param_types: &[S],
    ) -> Result<(), ExportError> {
        self.guard_registration()?;
        self.registry
            .unexport_method(None, interface, method, param_types);
        Ok(())
    }

    /// Remove one method signature from the given rpc id scope.
    pub fn unexport_method_with_id<S: AsRef<str>>(
        &self,
        rpc_id: &str,
        interface: &str,
        method: &str,
        param_types: &[S],
    ) -> Result<(), ExportError> {
        self.guard_registration()?;
        self.registry
            .unexport_method(Some(rpc_id), interface, method, param_types);
        Ok(())
    }

    /// Dispatcher handle for the transport to feed decoded calls into.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            Arc::clone(&self.state),
            self.shutdown.clone(),
        )
    }

    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    /// Read-only snapshot for monitoring.
    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            state: self.state.get(),
            exported_methods: self.registry.exported_methods(),
            live_calls: self.metrics.live_calls(),
            calls_dispatched: self.metrics.dispatched(),
            calls_succeeded: self.metrics.succeeded(),
            calls_failed: self.metrics.failed(),
        }
    }

    // Registrations are accepted while Created or Open; they only take
    // dispatch-observable effect once the server is Open.
    fn guard_registration(&self) -> Result<(), ExportError> {
        if self.state.get() == ServerState::Closed {
            Err(ExportError::ServerClosed)
        } else {
            Ok(())
        }
    }
}
