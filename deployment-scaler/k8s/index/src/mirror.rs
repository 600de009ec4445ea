use ahash::AHashMap as HashMap;
use deployment_scaler_core::{MirroredObject, ObjectKey};
use std::{
    collections::{hash_map::Entry, BTreeMap, BTreeSet},
    sync::Arc,
};

/// Holds the latest observed state of each deployment.
///
/// Entries are keyed by namespace and name, with a secondary index of names by namespace so that
/// listings are ordered without sorting the whole mirror. Entries are replaced wholesale, so a
/// reader holding an `Arc` never observes a partially applied event.
#[derive(Debug, Default)]
pub struct Mirror {
    by_key: HashMap<ObjectKey, Arc<MirroredObject>>,
    by_namespace: BTreeMap<String, BTreeSet<String>>,
}

/// Describes how an object was applied to the mirror.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Replaced,

    /// The object's version matches the stored version.
    Unchanged,

    /// The object's version precedes the stored version, so it was ignored.
    Stale,
}

// === impl Mirror ===

impl Mirror {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<MirroredObject>> {
        self.by_key.get(key).cloned()
    }

    /// Lists keys ordered by namespace and then name.
    pub fn keys(&self, namespace: Option<&str>) -> Vec<ObjectKey> {
        match namespace {
            Some(ns) => self
                .by_namespace
                .get(ns)
                .map(|names| {
                    names
                        .iter()
                        .map(|name| ObjectKey::new(ns, name.as_str()))
                        .collect()
                })
                .unwrap_or_default(),
            None => self
                .by_namespace
                .iter()
                .flat_map(|(ns, names)| {
                    names
                        .iter()
                        .map(move |name| ObjectKey::new(ns.as_str(), name.as_str()))
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Iterates over each namespace and the number of deployments it holds.
    pub fn namespaces(&self) -> impl Iterator<Item = (&str, usize)> {
        self.by_namespace
            .iter()
            .map(|(ns, names)| (ns.as_str(), names.len()))
    }

    pub(crate) fn objects(&self) -> impl Iterator<Item = &Arc<MirroredObject>> {
        self.by_key.values()
    }

    /// Inserts or replaces an object unless the stored entry is newer.
    pub(crate) fn apply(&mut self, obj: MirroredObject) -> Applied {
        match self.by_key.entry(obj.key.clone()) {
            Entry::Vacant(entry) => {
                self.by_namespace
                    .entry(obj.key.namespace.clone())
                    .or_default()
                    .insert(obj.key.name.clone());
                entry.insert(Arc::new(obj));
                Applied::Inserted
            }
            Entry::Occupied(mut entry) => {
                let current = &entry.get().resource_version;
                if obj.resource_version.is_older_than(current) {
                    return Applied::Stale;
                }
                if obj.resource_version == *current {
                    return Applied::Unchanged;
                }
                entry.insert(Arc::new(obj));
                Applied::Replaced
            }
        }
    }

    pub(crate) fn delete(&mut self, key: &ObjectKey) -> Option<Arc<MirroredObject>> {
        let removed = self.by_key.remove(key)?;
        if let Some(names) = self.by_namespace.get_mut(&key.namespace) {
            names.remove(&key.name);
            if names.is_empty() {
                self.by_namespace.remove(&key.namespace);
            }
        }
        Some(removed)
    }
}
