//! Registry mapping capability kinds to implementations.

use super::{Capability, CapabilityKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Registry for capability implementations.
///
/// Workflows resolve their stages against the registry once, when they are
/// registered with the orchestrator; later registry changes do not affect
/// already-registered workflows.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<CapabilityKind, Arc<dyn Capability>>>,
}

impl CapabilityRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability under its own kind.
    ///
    /// Returns the previously registered implementation, if any.
    pub fn register(&self, capability: Arc<dyn Capability>) -> Option<Arc<dyn Capability>> {
        let kind = capability.kind();
        self.register_as(kind, capability)
    }

    /// Registers a capability under an explicit kind.
    pub fn register_as(
        &self,
        kind: CapabilityKind,
        capability: Arc<dyn Capability>,
    ) -> Option<Arc<dyn Capability>> {
        let previous = self.entries.write().insert(kind.clone(), capability);
        if previous.is_some() {
            warn!(capability = %kind, "Capability replaced in registry");
        } else {
            debug!(capability = %kind, "Capability registered");
        }
        previous
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with(self, capability: Arc<dyn Capability>) -> Self {
        self.register(capability);
        self
    }

    /// Removes a capability.
    pub fn unregister(&self, kind: &CapabilityKind) -> bool {
        self.entries.write().remove(kind).is_some()
    }

    /// Looks up the implementation for a kind.
    #[must_use]
    pub fn resolve(&self, kind: &CapabilityKind) -> Option<Arc<dyn Capability>> {
        self.entries.read().get(kind).cloned()
    }

    /// Returns true if a kind is registered.
    #[must_use]
    pub fn contains(&self, kind: &CapabilityKind) -> bool {
        self.entries.read().contains_key(kind)
    }

    /// Returns all registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<CapabilityKind> {
        let mut kinds: Vec<_> = self.entries.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Returns the number of registered capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
