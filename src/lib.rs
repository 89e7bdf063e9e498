//! Server-side core of an RPC framework: an export registry, an invocation
//! dispatcher, and the server lifecycle that owns both.
//!
//! Transport and codec are external collaborators kept behind thin seams:
//! the listener lives behind [`Listener`], and argument/return payloads are
//! opaque [`bytes::Bytes`]. The transport decodes inbound bytes into a
//! [`CallDescriptor`], hands it to the [`Dispatcher`], and encodes the
//! resulting [`CallResult`] back onto the wire.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rpcserve::{
//!     CallOptions, FnService, InterfaceDef, MethodSig, RpcServer,
//!     RpcServerConfig,
//! };
//!
//! let calc = InterfaceDef::new("calc.Calculator")
//!     .method(MethodSig::new("add", ["i32", "i32"]));
//! let service = Arc::new(FnService::new().method(
//!     MethodSig::new("add", ["i32", "i32"]),
//!     |args| async move { /* decode, add, encode */ todo!() },
//! ));
//!
//! let server = RpcServer::new(RpcServerConfig::default());
//! server.export(&calc, service, CallOptions::default())?;
//! server.open().await?;
//!
//! // Transport side: decoded descriptor in, encoded result out.
//! let dispatcher = server.dispatcher();
//! let reply = dispatcher.dispatch(descriptor).await;
//! ```

pub mod dispatch;
pub mod error;
pub mod interface;
pub mod params;
pub mod registry;
pub mod server;
pub mod service;
pub mod status;

pub use dispatch::{CallDescriptor, CallReply, CallResult, CorrelationHandle, Dispatcher};
pub use error::{CallFailure, ExportError, ServerError};
pub use interface::{InterfaceDef, MethodKey, MethodSig};
pub use params::{CallMode, CallOptions, ThreadingPolicy};
pub use registry::{ExportEntry, ExportRegistry, ScopeKey};
pub use server::{Listener, RpcServer, RpcServerConfig};
pub use service::{FnService, InvokeRequest, RpcService, ServiceFault, ServiceFuture};
pub use status::{ServerState, ServerStatus};
