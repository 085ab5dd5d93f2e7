//! Reka intent store: validated, deduplicated desired state.

#![forbid(unsafe_code)]

use rustc_hash::FxHashMap;
use tracing::debug;

use reka_core::{InvalidIntent, ResourceId, ResourceIntent};

/// Desired state keyed by identity. Re-submitting an identity supersedes the
/// earlier intent (last write wins) while keeping its original position, so
/// snapshots stay in first-submission order.
#[derive(Debug, Default)]
pub struct IntentStore {
    map: FxHashMap<ResourceId, ResourceIntent>,
    order: Vec<ResourceId>,
}

impl IntentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            map: FxHashMap::with_capacity_and_hasher(cap, Default::default()),
            order: Vec::with_capacity(cap),
        }
    }

    /// Validate and record one intent. Nothing is stored on error.
    pub fn submit(&mut self, intent: ResourceIntent) -> Result<(), InvalidIntent> {
        intent.validate()?;
        let id = intent.id.clone();
        if self.map.insert(id.clone(), intent).is_some() {
            debug!(id = %id, "intent superseded");
        } else {
            self.order.push(id);
        }
        Ok(())
    }

    /// Validate and record a batch. The first invalid intent aborts the
    /// whole batch; intents before it are not kept.
    pub fn submit_all(
        &mut self,
        intents: impl IntoIterator<Item = ResourceIntent>,
    ) -> Result<(), InvalidIntent> {
        let mut staged = IntentStore::new();
        for intent in intents {
            staged.submit(intent)?;
        }
        for intent in staged.snapshot() {
            self.submit(intent)?;
        }
        Ok(())
    }

    /// Immutable copy of the current desired state in submission order.
    pub fn snapshot(&self) -> Vec<ResourceIntent> {
        self.order
            .iter()
            .filter_map(|id| self.map.get(id))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceIntent> {
        self.map.get(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
