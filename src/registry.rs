// src/registry.rs
//! Immutable registry snapshot and the read-side queries over it.
//!
//! A `Registry` is an `Arc` around a finished map. Publishing a new cycle swaps the
//! whole snapshot; readers holding an older clone keep a complete, consistent view.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::aggregate::{normalize_key, RelayAggregate};
use crate::capability::Capability;

#[derive(Debug, Clone, Default)]
pub struct Registry {
    relays: Arc<HashMap<String, RelayAggregate>>,
}

impl Registry {
    pub fn new(relays: HashMap<String, RelayAggregate>) -> Self {
        Self {
            relays: Arc::new(relays),
        }
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Lookup by relay address; the address is normalized first.
    pub fn get(&self, key: &str) -> Option<&RelayAggregate> {
        self.relays.get(&normalize_key(key))
    }

    /// Capabilities of one relay; empty when unknown.
    pub fn capabilities_of(&self, key: &str) -> BTreeSet<Capability> {
        self.get(key)
            .map(|r| r.capabilities.clone())
            .unwrap_or_default()
    }

    pub fn has_capability(&self, key: &str, cap: Capability) -> bool {
        self.get(key).is_some_and(|r| r.has_capability(cap))
    }

    /// All relays carrying `cap`. Order is unspecified.
    pub fn by_capability(&self, cap: Capability) -> Vec<RelayAggregate> {
        self.relays
            .values()
            .filter(|r| r.has_capability(cap))
            .cloned()
            .collect()
    }

    /// Relays carrying every capability in `caps`.
    pub fn by_capabilities(&self, caps: &[Capability]) -> Vec<RelayAggregate> {
        self.relays
            .values()
            .filter(|r| caps.iter().all(|c| r.has_capability(*c)))
            .cloned()
            .collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &RelayAggregate> {
        self.relays.values()
    }

    pub fn as_map(&self) -> &HashMap<String, RelayAggregate> {
        &self.relays
    }

    /// True when both handles point at the same published snapshot.
    pub fn same_snapshot(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.relays, &other.relays)
    }
}

impl From<HashMap<String, RelayAggregate>> for Registry {
    fn from(relays: HashMap<String, RelayAggregate>) -> Self {
        Self::new(relays)
    }
}
