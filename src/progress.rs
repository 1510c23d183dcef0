//! Observation of evaluation progress.
//!
//! The default [`NoopProgressReceiver`] ignores every event.

use papaya::HashMap;

use crate::{Key, NodeId, Value};

/// How a node came to be done in an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationState {
    /// The node was computed at the current version.
    Built,
    /// The node was reused from an earlier version.
    Clean,
}

/// Receiver of evaluation progress events.
///
/// All methods have default empty implementations. Implementations must be
/// `Send + Sync` as events are delivered from worker threads.
pub trait EvaluationProgressReceiver: Send + Sync + 'static {
    /// Called when a node is handed to the worker pool.
    #[inline]
    fn enqueueing(&self, _key: &Key) {}

    /// Called when a node is done. `value` is `None` if the node is in error.
    #[inline]
    fn evaluated(&self, _key: &Key, _value: Option<&Value>, _state: EvaluationState) {}

    /// Called when a value was injected.
    #[inline]
    fn injected(&self, _key: &Key) {}

    /// Called when a done node was marked dirty.
    #[inline]
    fn invalidated(&self, _key: &Key) {}
}

/// Receiver that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressReceiver;

impl EvaluationProgressReceiver for NoopProgressReceiver {}

/// Nodes created or enqueued by an evaluation that are not done yet.
#[derive(Default)]
pub(crate) struct InflightNodes {
    nodes: HashMap<NodeId, Key, ahash::RandomState>,
}

impl InflightNodes {
    pub fn insert(&self, id: NodeId, key: Key) {
        self.nodes.pin().insert(id, key);
    }

    pub fn remove(&self, id: NodeId) {
        self.nodes.pin().remove(&id);
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.pin().contains_key(&id)
    }

    pub fn keys(&self) -> Vec<Key> {
        self.nodes.pin().values().cloned().collect()
    }
}
