use std::time::Duration;

use thiserror::Error;

use crate::interface::MethodKey;
use crate::service::ServiceFault;

/// Errors surfaced synchronously by the export/unexport API.
///
/// A failed export leaves the registry unchanged: a whole-interface export
/// either registers every method or none.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExportError {
    /// The interface declares no methods, or the implementor does not cover
    /// the interface's declared method set.
    #[error("invalid interface '{interface}': {reason}")]
    InvalidInterface { interface: String, reason: String },

    /// The named method/signature is not declared on the interface.
    #[error("unknown method '{method}' on interface '{interface}'")]
    UnknownMethod { interface: String, method: String },

    /// The server has been closed; registrations are no longer accepted.
    #[error("server closed")]
    ServerClosed,
}

/// Typed failure channel for one dispatched call.
///
/// Dispatch never unwinds across the dispatcher boundary; every failure mode
/// is converted into one of these and handed back as the call result.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CallFailure {
    /// No registration matches the call descriptor. An id-scoped miss is
    /// reported as-is; it never falls back to the default scope.
    #[error("no export for '{key}'")]
    NoSuchExport {
        key: MethodKey,
        rpc_id: Option<String>,
    },

    /// The implementor faulted. The fault payload is carried through
    /// untouched; the server and registry are unaffected.
    #[error("application fault: {0}")]
    Application(#[from] ServiceFault),

    /// The invocation exceeded its configured wall-clock budget.
    #[error("invocation exceeded budget of {budget:?}")]
    InvocationTimeout { budget: Duration },

    /// The call arrived after shutdown, or was cancelled by it.
    #[error("server closed")]
    ServerClosed,
}

/// Errors from server lifecycle operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// The transport listener failed to start.
    #[error("listener failed to open: {0}")]
    Listener(String),
}
