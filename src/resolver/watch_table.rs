//! Edge table from external objects to the configs that consume them

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use super::ExternalKey;
use crate::adapters::meta::WATCHER_ANNOTATION;

/// Directed edges `{external object → owner config name}`.
///
/// The resolver replaces an owner's edges at the start of every cycle, before
/// any fetch, so a reference to an object that does not exist yet is still
/// recorded and its creation re-triggers the owner. Cloning shares the table.
#[derive(Clone, Debug, Default)]
pub struct WatchTable {
    edges: Arc<RwLock<BTreeMap<ExternalKey, BTreeSet<String>>>>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every edge pointing at `owner` with `targets`
    pub fn replace_edges(&self, owner: &str, targets: impl IntoIterator<Item = ExternalKey>) {
        let mut edges = self.edges.write().unwrap_or_else(PoisonError::into_inner);
        edges.retain(|_, owners| {
            owners.remove(owner);
            !owners.is_empty()
        });
        for target in targets {
            edges.entry(target).or_default().insert(owner.to_string());
        }
    }

    /// Drop every edge pointing at `owner`
    pub fn remove_owner(&self, owner: &str) {
        self.replace_edges(owner, std::iter::empty());
    }

    pub fn owners_of(&self, target: &ExternalKey) -> BTreeSet<String> {
        let edges = self.edges.read().unwrap_or_else(PoisonError::into_inner);
        edges.get(target).cloned().unwrap_or_default()
    }

    /// Owners to re-trigger for a changed object: table edges plus the
    /// watcher stamp, which survives an operator restart.
    pub fn owners_for(
        &self,
        target: &ExternalKey,
        annotations: &BTreeMap<String, String>,
    ) -> BTreeSet<String> {
        let mut owners = self.owners_of(target);
        if let Some(owner) = annotations.get(WATCHER_ANNOTATION) {
            owners.insert(owner.clone());
        }
        owners
    }

    pub fn edges_of(&self, owner: &str) -> Vec<ExternalKey> {
        let edges = self.edges.read().unwrap_or_else(PoisonError::into_inner);
        edges
            .iter()
            .filter(|(_, owners)| owners.contains(owner))
            .map(|(target, _)| target.clone())
            .collect()
    }
}
