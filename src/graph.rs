use std::collections::HashSet;
use std::sync::Arc;

use papaya::HashMap;
use parking_lot::RwLock;
use slab::Slab;

use crate::{EvaluationProgressReceiver, Key, NodeEntry, NodeId};

/// In-memory store of every node, addressed by key or by arena index.
///
/// Nodes persist across evaluations until they are removed.
#[derive(Default)]
pub struct InMemoryGraph {
    index: HashMap<Key, NodeId, ahash::RandomState>,
    nodes: RwLock<Slab<Arc<NodeEntry>>>,
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<InMemoryGraph>();
    assert_sync::<InMemoryGraph>();
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Default::default()
    }

    /// Get the node for a key.
    pub fn get(&self, key: &Key) -> Option<Arc<NodeEntry>> {
        let id = *self.index.pin().get(key)?;
        self.nodes.read().get(id.0).cloned()
    }

    /// Get the nodes for several keys, in order.
    pub fn get_batch(&self, keys: &[Key]) -> Vec<Option<Arc<NodeEntry>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Get a node by index.
    ///
    /// # Panics
    ///
    /// Panics if the node was removed.
    pub fn entry(&self, id: NodeId) -> Arc<NodeEntry> {
        self.nodes
            .read()
            .get(id.0)
            .cloned()
            .unwrap_or_else(|| panic!("no node at {:?}", id))
    }

    /// Get the node for a key, creating it if it does not exist.
    pub fn create_if_absent(&self, key: &Key) -> Arc<NodeEntry> {
        if let Some(entry) = self.get(key) {
            return entry;
        }
        let mut nodes = self.nodes.write();
        // Another thread may have created it before we took the lock.
        if let Some(id) = self.index.pin().get(key) {
            return nodes[id.0].clone();
        }
        let vacant = nodes.vacant_entry();
        let id = NodeId(vacant.key());
        let entry = Arc::new(NodeEntry::new(id, key.clone()));
        vacant.insert(entry.clone());
        self.index.pin().insert(key.clone(), id);
        entry
    }

    /// Get or create the nodes for several keys, in order.
    pub fn create_if_absent_batch(&self, keys: &[Key]) -> Vec<Arc<NodeEntry>> {
        keys.iter().map(|key| self.create_if_absent(key)).collect()
    }

    /// Marks the nodes for `keys` dirty, and their transitive reverse
    /// dependencies dirty with a dependency check. Keys without a node are ignored.
    ///
    /// Must not be called while an evaluation is running.
    pub fn invalidate(
        &self,
        keys: &[Key],
        changed: bool,
        receiver: &dyn EvaluationProgressReceiver,
    ) {
        let mut stack: Vec<(Arc<NodeEntry>, bool)> = keys
            .iter()
            .filter_map(|key| self.get(key))
            .map(|entry| (entry, changed))
            .collect();
        while let Some((entry, changed)) = stack.pop() {
            if let Some(parents) = entry.mark_dirty(changed) {
                tracing::trace!(key = ?entry.key(), changed, "invalidated");
                receiver.invalidated(entry.key());
                stack.extend(parents.into_iter().map(|id| (self.entry(id), false)));
            }
        }
    }

    /// Removes the nodes for `keys` and, transitively, every node depending on
    /// them. Returns the removed keys.
    ///
    /// Must not be called while an evaluation is running.
    pub fn remove_recursive(&self, keys: &[Key]) -> Vec<Key> {
        let mut removed: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<NodeId> = keys
            .iter()
            .filter_map(|key| self.index.pin().get(key).copied())
            .collect();
        while let Some(id) = stack.pop() {
            if removed.insert(id) {
                stack.extend(self.entry(id).reverse_deps());
            }
        }

        for id in &removed {
            let entry = self.entry(*id);
            let deps = entry
                .direct_deps()
                .into_iter()
                .chain(entry.temporary_direct_deps())
                .flatten();
            for dep in deps {
                if !removed.contains(&dep) {
                    self.entry(dep).remove_reverse_dep(*id);
                }
            }
        }

        let mut nodes = self.nodes.write();
        let index = self.index.pin();
        removed
            .into_iter()
            .map(|id| {
                let entry = nodes.remove(id.0);
                index.remove(entry.key());
                entry.key().clone()
            })
            .collect()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Returns true if there are no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of all nodes.
    pub fn keys(&self) -> Vec<Key> {
        self.index.pin().keys().cloned().collect()
    }
}
