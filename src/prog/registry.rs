use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::Prog;

/// A strand names a prog that no registered type provides.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("BUG: unknown workflow type '{0}'")]
pub struct UnknownWorkflowType(pub String);

/// Registry mapping workflow type names to their implementations.
///
/// Built once at worker startup and shared read-only afterwards.
#[derive(Default, Clone)]
pub struct ProgRegistry {
    progs: HashMap<String, Arc<dyn Prog>>,
}

impl ProgRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a prog under its own name. A later registration of the
    /// same name replaces the earlier one.
    pub fn register(&mut self, prog: impl Prog + 'static) {
        self.register_arc(Arc::new(prog));
    }

    /// Registers an already shared prog.
    pub fn register_arc(&mut self, prog: Arc<dyn Prog>) {
        let name = prog.name().to_string();
        if self.progs.insert(name.clone(), prog).is_some() {
            tracing::warn!(prog = %name, "Replacing previously registered prog");
        }
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with(mut self, prog: impl Prog + 'static) -> Self {
        self.register(prog);
        self
    }

    /// Looks a prog up by name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownWorkflowType` if nothing is registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Prog>, UnknownWorkflowType> {
        self.progs
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownWorkflowType(name.to_string()))
    }

    /// Returns true if a prog is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.progs.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.progs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered progs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.progs.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.progs.is_empty()
    }
}

impl std::fmt::Debug for ProgRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgRegistry")
            .field("progs", &self.names())
            .finish()
    }
}
