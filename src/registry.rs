use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::error::ExportError;
use crate::interface::{InterfaceDef, MethodKey, MethodSig};
use crate::params::CallOptions;
use crate::service::RpcService;

/// A composite registry key: (rpc id scope, interface identity).
///
/// `rpc_id: None` is the default scope. The default scope and named scopes
/// coexist independently and never share entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub rpc_id: Option<String>,
    pub interface: String,
}

impl ScopeKey {
    pub fn new(rpc_id: Option<&str>, interface: impl Into<String>) -> Self {
        Self {
            rpc_id: rpc_id.map(str::to_owned),
            interface: interface.into(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rpc_id {
            Some(id) => write!(f, "{}:{}", id, self.interface),
            None => write!(f, "default:{}", self.interface),
        }
    }
}

/// One live registration: an implementor plus behavioral parameters, shared
/// by every method signature a single export call registered.
///
/// Resolution hands out the `Arc`; an in-flight call keeps its entry alive
/// even if a concurrent unexport removes it from the registry.
pub struct ExportEntry {
    pub rpc_id: Option<String>,
    pub interface: String,
    pub methods: Vec<MethodSig>,
    pub options: CallOptions,
    service: Arc<dyn RpcService>,
    limiter: Option<Arc<Semaphore>>,
}

impl ExportEntry {
    fn new(
        scope: &ScopeKey,
        methods: Vec<MethodSig>,
        service: Arc<dyn RpcService>,
        options: CallOptions,
    ) -> Arc<Self> {
        let limiter = options.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));
        Arc::new(Self {
            rpc_id: scope.rpc_id.clone(),
            interface: scope.interface.clone(),
            methods,
            options,
            service,
            limiter,
        })
    }

    /// The method keys this export call registered.
    pub fn method_keys(&self) -> impl Iterator<Item = MethodKey> + '_ {
        self.methods
            .iter()
            .map(|sig| MethodKey::new(self.interface.clone(), sig.clone()))
    }

    pub(crate) fn service(&self) -> &Arc<dyn RpcService> {
        &self.service
    }

    pub(crate) fn limiter(&self) -> Option<&Arc<Semaphore>> {
        self.limiter.as_ref()
    }
}

impl fmt::Debug for ExportEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportEntry")
            .field("rpc_id", &self.rpc_id)
            .field("interface", &self.interface)
            .field("methods", &self.methods)
            .finish()
    }
}

type MethodTable = HashMap<MethodSig, Arc<ExportEntry>, ahash::RandomState>;

/// Concurrent mapping from (rpc id, interface, method signature) to live
/// registrations.
///
/// Lookups never observe a partially applied mutation: a registration change
/// takes a brief exclusive section on the one scope+interface cell it
/// touches, so dispatch to unrelated interfaces is never stalled by it.
pub struct ExportRegistry {
    entries: DashMap<ScopeKey, MethodTable, ahash::RandomState>,
    exported: AtomicUsize,
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::default(),
            exported: AtomicUsize::new(0),
        }
    }

    /// Register every declared method of `iface` under one entry.
    ///
    /// All-or-nothing: validation completes before the registry is touched.
    /// Per-signature registration is last-writer-wins, not a merge.
    pub fn export_all(
        &self,
        rpc_id: Option<&str>,
        iface: &InterfaceDef,
        service: Arc<dyn RpcService>,
        options: CallOptions,
    ) -> Result<Arc<ExportEntry>, ExportError> {
        if iface.methods().is_empty() {
            return Err(ExportError::InvalidInterface {
                interface: iface.name().to_owned(),
                reason: "interface declares no methods".to_owned(),
            });
        }
        let provided = service.provided();
        for sig in iface.methods() {
            if !provided.contains(sig) {
                return Err(ExportError::InvalidInterface {
                    interface: iface.name().to_owned(),
                    reason: format!("implementor does not provide {sig}"),
                });
            }
        }

        let scope = ScopeKey::new(rpc_id, iface.name());
        let entry = ExportEntry::new(&scope, iface.methods().to_vec(), service, options);
        self.install(scope, &entry);
        Ok(entry)
    }

    /// Register exactly one declared method signature.
    pub fn export_method<S: AsRef<str>>(
        &self,
        rpc_id: Option<&str>,
        iface: &InterfaceDef,
        method: &str,
        param_types: &[S],
        service: Arc<dyn RpcService>,
        options: CallOptions,
    ) -> Result<Arc<ExportEntry>, ExportError> {
        let sig = iface
            .find(method, param_types)
            .cloned()
            .ok_or_else(|| ExportError::UnknownMethod {
                interface: iface.name().to_owned(),
                method: method.to_owned(),
            })?;

        let scope = ScopeKey::new(rpc_id, iface.name());
        let entry = ExportEntry::new(&scope, vec![sig], service, options);
        self.install(scope, &entry);
        Ok(entry)
    }

    fn install(&self, scope: ScopeKey, entry: &Arc<ExportEntry>) {
        let mut table = self.entries.entry(scope.clone()).or_default();
        let mut added = 0;
        for sig in &entry.methods {
            if table.insert(sig.clone(), Arc::clone(entry)).is_none() {
                added += 1;
            }
        }
        // Gauge adjusted while the cell is still locked, so status readers
        // never see a count that disagrees with the table.
        self.exported.fetch_add(added, Ordering::Release);
        drop(table);

        info!(scope = %scope, methods = entry.methods.len(), "exported");
    }

    /// Remove every signature currently registered for this scope+interface,
    /// however it was populated. A no-op if none exist.
    pub fn unexport_all(&self, rpc_id: Option<&str>, interface: &str) {
        let scope = ScopeKey::new(rpc_id, interface);
        if let Some((_, table)) = self.entries.remove(&scope) {
            self.exported.fetch_sub(table.len(), Ordering::Release);
            info!(scope = %scope, methods = table.len(), "unexported interface");
        }
    }

    /// Remove one signature. A no-op if it is not registered.
    pub fn unexport_method<S: AsRef<str>>(
        &self,
        rpc_id: Option<&str>,
        interface: &str,
        method: &str,
        param_types: &[S],
    ) {
        let scope = ScopeKey::new(rpc_id, interface);
        let sig = MethodSig::new(method, param_types.iter().map(|s| s.as_ref()));

        if let Entry::Occupied(mut cell) = self.entries.entry(scope.clone()) {
            if cell.get_mut().remove(&sig).is_some() {
                self.exported.fetch_sub(1, Ordering::Release);
                debug!(scope = %scope, method = %sig, "unexported method");
            }
            if cell.get().is_empty() {
                cell.remove();
            }
        }
    }

    /// Exact-match lookup.
    ///
    /// When `rpc_id` is supplied but no id-scoped entry exists, this is a
    /// miss; it does not fall back to the default scope.
    pub fn resolve<S: AsRef<str>>(
        &self,
        rpc_id: Option<&str>,
        interface: &str,
        method: &str,
        param_types: &[S],
    ) -> Option<Arc<ExportEntry>> {
        let scope = ScopeKey::new(rpc_id, interface);
        let sig = MethodSig::new(method, param_types.iter().map(|s| s.as_ref()));
        self.entries.get(&scope)?.get(&sig).cloned()
    }

    /// Number of live exported method registrations.
    pub fn exported_methods(&self) -> usize {
        self.exported.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every registration. Invoked on server close.
    pub fn clear(&self) {
        self.entries.clear();
        self.exported.store(0, Ordering::Release);
    }
}

impl Default for ExportRegistry {
    fn default() -> Self {
        Self::new()
    }
}
