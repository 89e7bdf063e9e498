use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::interface::MethodSig;

/// An application-level fault raised by an implementor.
///
/// The optional payload is an encoded fault body, carried back to the codec
/// layer untouched.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ServiceFault {
    pub message: String,
    pub payload: Option<Bytes>,
}

impl ServiceFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            payload: None,
        }
    }

    /// Attach an encoded fault payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// One decoded invocation handed to an implementor.
#[derive(Debug)]
pub struct InvokeRequest {
    pub method: MethodSig,
    /// Argument payloads, one per parameter, already decoded from the wire
    /// by the codec collaborator and opaque to the dispatch core.
    pub args: Vec<Bytes>,
}

/// The future returned by implementor invocations.
pub type ServiceFuture = BoxFuture<'static, Result<Bytes, ServiceFault>>;

/// A remotely callable implementor.
///
/// Implementors own their business state; the registry holds them behind an
/// `Arc` and never controls their lifetime beyond the in-flight calls that
/// resolved them.
pub trait RpcService: Send + Sync {
    /// The method signatures this implementor can serve. Checked against the
    /// interface's declared method set at export time.
    fn provided(&self) -> Vec<MethodSig>;

    /// Invoke one method. The returned future must be `'static`: clone any
    /// state it needs before returning.
    fn invoke(&self, call: InvokeRequest) -> ServiceFuture;
}

type MethodFn = Arc<dyn Fn(Vec<Bytes>) -> ServiceFuture + Send + Sync>;

/// A closure-backed [`RpcService`], assembled method by method.
pub struct FnService {
    methods: HashMap<MethodSig, MethodFn, ahash::RandomState>,
}

impl FnService {
    pub fn new() -> Self {
        Self {
            methods: HashMap::default(),
        }
    }

    /// Register a handler for one method signature.
    ///
    /// This handles the boxing of the closure and its return type.
    pub fn method<F, Fut>(mut self, sig: MethodSig, f: F) -> Self
    where
        F: Fn(Vec<Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, ServiceFault>> + Send + 'static,
    {
        self.methods
            .insert(sig, Arc::new(move |args| -> ServiceFuture { Box::pin(f(args)) }));
        self
    }
}

impl Default for FnService {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcService for FnService {
    fn provided(&self) -> Vec<MethodSig> {
        self.methods.keys().cloned().collect()
    }

    fn invoke(&self, call: InvokeRequest) -> ServiceFuture {
        match self.methods.get(&call.method) {
            Some(f) => f(call.args),
            None => {
                let sig = call.method;
                Box::pin(async move { Err(ServiceFault::new(format!("method not provided: {sig}"))) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_i32(v: i32) -> Bytes {
        Bytes::copy_from_slice(&v.to_le_bytes())
    }

    fn decode_i32(b: &Bytes) -> i32 {
        i32::from_le_bytes(b.as_ref().try_into().unwrap())
    }

    #[tokio::test]
    async fn test_fn_service_routes_to_registered_closure() {
        let add = MethodSig::new("add", ["i32", "i32"]);
        let neg = MethodSig::new("neg", ["i32"]);

        let svc = FnService::new()
            .method(add.clone(), |args| async move {
                Ok(encode_i32(decode_i32(&args[0]) + decode_i32(&args[1])))
            })
            .method(neg.clone(), |args| async move {
                Ok(encode_i32(-decode_i32(&args[0])))
            });

        assert_eq!(svc.provided().len(), 2);

        let result = svc
            .invoke(InvokeRequest {
                method: add,
                args: vec![encode_i32(2), encode_i32(3)],
            })
            .await
            .unwrap();
        assert_eq!(decode_i32(&result), 5);

        let result = svc
            .invoke(InvokeRequest {
                method: neg,
                args: vec![encode_i32(7)],
            })
            .await
            .unwrap();
        assert_eq!(decode_i32(&result), -7);
    }

    #[tokio::test]
    async fn test_fn_service_unknown_method_faults() {
        let svc = FnService::new();
        let fault = svc
            .invoke(InvokeRequest {
                method: MethodSig::new("missing", ["i32"]),
                args: vec![],
            })
            .await
            .unwrap_err();
        assert!(fault.message.contains("missing"));
    }

    #[test]
    fn test_fault_payload_round_trip() {
        let fault = ServiceFault::new("boom").with_payload(&b"detail"[..]);
        assert_eq!(fault.to_string(), "boom");
        assert_eq!(fault.payload.as_deref(), Some(&b"detail"[..]));
    }
}
