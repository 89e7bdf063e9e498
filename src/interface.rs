use std::fmt;

/// The exact signature of one method: name plus ordered parameter-type names.
///
/// Equality is structural over both fields, with parameter types compared by
/// exact ordered identity. There is no coercion or supertype matching
/// anywhere in the lookup path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
    pub name: String,
    pub param_types: Vec<String>,
}

impl MethodSig {
    pub fn new(
        name: impl Into<String>,
        param_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            param_types: param_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Exact comparison against a (name, parameter types) pair.
    pub fn matches<S: AsRef<str>>(&self, name: &str, param_types: &[S]) -> bool {
        self.name == name
            && self
                .param_types
                .iter()
                .map(String::as_str)
                .eq(param_types.iter().map(|s| s.as_ref()))
    }
}

impl fmt::Display for MethodSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.param_types.join(","))
    }
}

/// Immutable identity of one exported method signature on one interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub interface: String,
    pub sig: MethodSig,
}

impl MethodKey {
    pub fn new(interface: impl Into<String>, sig: MethodSig) -> Self {
        Self {
            interface: interface.into(),
            sig,
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.interface, self.sig)
    }
}

/// The declared method set of a remotely callable interface.
///
/// The exporter enumerates the method set once, at declaration time; the
/// registry and dispatcher never re-derive it per call.
#[derive(Debug, Clone)]
pub struct InterfaceDef {
    name: String,
    methods: Vec<MethodSig>,
}

impl InterfaceDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Declare a method on this interface.
    pub fn method(mut self, sig: MethodSig) -> Self {
        self.methods.push(sig);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[MethodSig] {
        &self.methods
    }

    /// Find the declared method with this exact name and parameter-type
    /// sequence, if any.
    pub fn find<S: AsRef<str>>(&self, name: &str, param_types: &[S]) -> Option<&MethodSig> {
        self.methods.iter().find(|m| m.matches(name, param_types))
    }
}
