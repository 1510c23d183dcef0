//! Per-node state and its transitions.
//!
//! Every mutation of a node goes through one of the transition functions of
//! [`NodeEntry`], each of which runs under the node's own lock.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{ErrorInfo, Key, Value, Version};

/// Index of a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// Dependencies grouped in the order they were requested.
///
/// Dependencies requested together by one `get_values` call form one group.
pub type GroupedDeps = Vec<Vec<NodeId>>;

/// Dirty sub-state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// Not dirtied since it was last built.
    Clean,
    /// Dependencies of the last build must be checked, group by group.
    CheckDependencies,
    /// A dependency changed, so the node must be recomputed.
    NeedsRebuilding,
    /// The node is being recomputed.
    Rebuilding,
    /// A dirty re-evaluation has concluded.
    Done,
}

impl DirtyState {
    /// Returns true while a re-evaluation is pending or running.
    pub fn is_dirty(self) -> bool {
        matches!(
            self,
            DirtyState::CheckDependencies | DirtyState::NeedsRebuilding | DirtyState::Rebuilding
        )
    }
}

/// Result of registering a parent on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    /// The node has not started evaluating. The caller must enqueue it.
    NeedsScheduling,
    /// The node is done.
    Done,
    /// The node is already evaluating and will signal the parent when done.
    AlreadyEvaluating,
}

/// Outcome of [`NodeEntry::set_value`].
#[derive(Debug)]
pub(crate) struct SetValueOutcome {
    /// Parents waiting for this node.
    pub reverse_deps_to_signal: Vec<NodeId>,
    /// Dependencies of the previous build that the new build dropped.
    pub removed_deps: Vec<NodeId>,
    /// Version the node ended at. Older than the evaluation version if the value was pruned.
    pub version: Version,
}

#[derive(Debug, Default)]
struct BuildingState {
    evaluating: bool,
    temporary_direct_deps: GroupedDeps,
    signaled_deps: usize,
    reverse_deps_to_signal: Vec<NodeId>,
    dirty_groups_checked: usize,
}

impl BuildingState {
    fn num_temporary_deps(&self) -> usize {
        self.temporary_direct_deps.iter().map(Vec::len).sum()
    }

    fn is_ready(&self) -> bool {
        self.signaled_deps == self.num_temporary_deps()
    }
}

#[derive(Debug)]
struct NodeState {
    value: Option<Value>,
    error: Option<Arc<ErrorInfo>>,
    version: Version,
    last_evaluated_version: Version,
    direct_deps: GroupedDeps,
    reverse_deps: Vec<NodeId>,
    dirty: DirtyState,
    /// `Some` while the node is not done.
    building: Option<BuildingState>,
}

impl NodeState {
    fn building(&mut self) -> &mut BuildingState {
        match self.building.as_mut() {
            Some(building) => building,
            None => panic!("node is done"),
        }
    }
}

/// A node of the evaluation graph.
#[derive(Debug)]
pub struct NodeEntry {
    id: NodeId,
    key: Key,
    state: Mutex<NodeState>,
}

impl NodeEntry {
    pub(crate) fn new(id: NodeId, key: Key) -> Self {
        Self {
            id,
            key,
            state: Mutex::new(NodeState {
                value: None,
                error: None,
                version: Version::MINIMAL,
                last_evaluated_version: Version::MINIMAL,
                direct_deps: Vec::new(),
                reverse_deps: Vec::new(),
                dirty: DirtyState::Clean,
                building: Some(BuildingState::default()),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Returns true if the node holds a value or an error for the current version.
    pub fn is_done(&self) -> bool {
        self.state.lock().building.is_none()
    }

    /// Returns true if the node is being re-evaluated after invalidation.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty.is_dirty()
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.state.lock().dirty
    }

    /// Returns true if the node has started evaluating and is not done.
    pub fn is_evaluating(&self) -> bool {
        self.state
            .lock()
            .building
            .as_ref()
            .is_some_and(|building| building.evaluating)
    }

    /// The value of the last build, even while the node is being re-evaluated.
    pub fn value(&self) -> Option<Value> {
        self.state.lock().value.clone()
    }

    pub fn error_info(&self) -> Option<Arc<ErrorInfo>> {
        self.state.lock().error.clone()
    }

    /// Version at which the value last changed.
    pub fn version(&self) -> Version {
        self.state.lock().version
    }

    /// Registers `parent` as a reverse dependency and reports whether this node is
    /// done. `None` registers the evaluation itself as the parent.
    ///
    /// Registration and the done check happen atomically, so a parent either
    /// sees the node done or is signalled when it becomes done.
    pub fn add_reverse_dep_and_check_if_done(&self, parent: Option<NodeId>) -> DependencyState {
        let mut state = self.state.lock();
        if let Some(parent) = parent {
            if !state.reverse_deps.contains(&parent) {
                state.reverse_deps.push(parent);
            }
        }
        let Some(building) = state.building.as_mut() else {
            return DependencyState::Done;
        };
        if let Some(parent) = parent {
            building.reverse_deps_to_signal.push(parent);
        }
        if building.evaluating {
            DependencyState::AlreadyEvaluating
        } else {
            building.evaluating = true;
            DependencyState::NeedsScheduling
        }
    }

    /// Adds a group of dependencies that must signal before the node is ready.
    pub fn add_temporary_direct_deps(&self, group: Vec<NodeId>) {
        if group.is_empty() {
            return;
        }
        self.state.lock().building().temporary_direct_deps.push(group);
    }

    pub fn temporary_direct_deps_contain(&self, id: NodeId) -> bool {
        self.state
            .lock()
            .building
            .as_ref()
            .is_some_and(|b| b.temporary_direct_deps.iter().flatten().any(|dep| *dep == id))
    }

    /// Dependencies registered so far by an unfinished evaluation.
    pub fn temporary_direct_deps(&self) -> GroupedDeps {
        self.state
            .lock()
            .building
            .as_ref()
            .map(|b| b.temporary_direct_deps.clone())
            .unwrap_or_default()
    }

    /// Signals that one dependency is done at `child_version`. Returns true if the
    /// node is now ready to be evaluated.
    pub fn signal_dep(&self, child_version: Version) -> bool {
        let mut state = self.state.lock();
        let last_evaluated = state.last_evaluated_version;
        let dirty = state.dirty;
        let building = state.building();
        building.signaled_deps += 1;
        assert!(
            building.signaled_deps <= building.num_temporary_deps(),
            "more signals than dependencies"
        );
        let ready = building.is_ready();
        if dirty == DirtyState::CheckDependencies && !child_version.at_most(last_evaluated) {
            state.dirty = DirtyState::NeedsRebuilding;
        }
        ready
    }

    /// Returns the next group of last-build dependencies to check, and adds it to
    /// the temporary dependencies. `None` once every group has been checked.
    pub fn next_dirty_dep_group(&self) -> Option<Vec<NodeId>> {
        let mut state = self.state.lock();
        assert_eq!(state.dirty, DirtyState::CheckDependencies);
        let index = state.building().dirty_groups_checked;
        let group = state.direct_deps.get(index)?.clone();
        let building = state.building();
        building.dirty_groups_checked += 1;
        building.temporary_direct_deps.push(group.clone());
        Some(group)
    }

    /// Concludes a dirty check that found no changed dependency. The node keeps its
    /// value and version. Returns the parents to signal.
    pub fn mark_clean(&self, version: Version) -> Vec<NodeId> {
        let mut state = self.state.lock();
        assert_eq!(state.dirty, DirtyState::CheckDependencies);
        let building = state
            .building
            .take()
            .unwrap_or_else(|| panic!("{:?} is already done", self.key));
        assert!(building.is_ready(), "unsignaled dependencies on clean node");
        state.dirty = DirtyState::Done;
        state.last_evaluated_version = version;
        building.reverse_deps_to_signal
    }

    /// Starts recomputing a node whose dependency changed.
    pub fn mark_rebuilding(&self) {
        let mut state = self.state.lock();
        assert_eq!(state.dirty, DirtyState::NeedsRebuilding);
        state.dirty = DirtyState::Rebuilding;
        let building = state.building();
        assert!(building.is_ready(), "unsignaled dependencies on rebuilding node");
        building.temporary_direct_deps.clear();
        building.signaled_deps = 0;
    }

    /// Skips the dependency check of a dirty node and recomputes it directly.
    pub fn force_rebuild(&self) {
        let mut state = self.state.lock();
        if !state.dirty.is_dirty() {
            return;
        }
        if state.dirty == DirtyState::Rebuilding {
            return;
        }
        state.dirty = DirtyState::Rebuilding;
        let building = state.building();
        building.temporary_direct_deps.clear();
        building.signaled_deps = 0;
    }

    /// Commits a value or error. The node becomes done.
    ///
    /// If a rebuilt node ends with a value equal to its previous one, it keeps its
    /// previous version.
    pub(crate) fn set_value(
        &self,
        value: Option<Value>,
        error: Option<Arc<ErrorInfo>>,
        version: Version,
    ) -> SetValueOutcome {
        assert!(value.is_some() || error.is_some(), "node committed without outcome");
        let mut state = self.state.lock();
        let building = state
            .building
            .take()
            .unwrap_or_else(|| panic!("{:?} is already done", self.key));
        assert!(building.evaluating, "{:?} committed without evaluating", self.key);
        assert!(
            building.is_ready(),
            "{:?} committed with unsignaled dependencies",
            self.key
        );

        let unchanged = state.dirty.is_dirty()
            && error.is_none()
            && state.error.is_none()
            && state.value.is_some()
            && state.value == value;

        let new_deps = building.temporary_direct_deps;
        let removed_deps = state
            .direct_deps
            .iter()
            .flatten()
            .filter(|dep| !new_deps.iter().flatten().any(|new| new == *dep))
            .copied()
            .collect();

        if state.dirty.is_dirty() {
            state.dirty = DirtyState::Done;
        }
        if !unchanged {
            state.version = version;
            state.value = value;
        }
        state.error = error;
        state.last_evaluated_version = version;
        state.direct_deps = new_deps;

        SetValueOutcome {
            reverse_deps_to_signal: building.reverse_deps_to_signal,
            removed_deps,
            version: state.version,
        }
    }

    /// Marks a done node dirty. `changed` nodes are rebuilt, others check their
    /// dependencies first. Returns the reverse dependencies if the node was done
    /// and must propagate the invalidation.
    pub(crate) fn mark_dirty(&self, changed: bool) -> Option<Vec<NodeId>> {
        let mut state = self.state.lock();
        match state.building.as_ref() {
            None => {
                state.dirty = if changed {
                    DirtyState::NeedsRebuilding
                } else {
                    DirtyState::CheckDependencies
                };
                state.building = Some(BuildingState::default());
                Some(state.reverse_deps.clone())
            }
            Some(building) => {
                assert!(!building.evaluating, "{:?} dirtied while evaluating", self.key);
                if changed && state.dirty == DirtyState::CheckDependencies {
                    state.dirty = DirtyState::NeedsRebuilding;
                }
                None
            }
        }
    }

    /// Parents registered while this node was not done.
    pub fn in_progress_reverse_deps(&self) -> Vec<NodeId> {
        self.state
            .lock()
            .building
            .as_ref()
            .map(|b| b.reverse_deps_to_signal.clone())
            .unwrap_or_default()
    }

    /// All known parents.
    pub fn reverse_deps(&self) -> Vec<NodeId> {
        self.state.lock().reverse_deps.clone()
    }

    /// Dependencies of the last completed build.
    pub fn direct_deps(&self) -> GroupedDeps {
        self.state.lock().direct_deps.clone()
    }

    /// Returns true if the last build declared no dependencies.
    pub fn no_deps_last_build(&self) -> bool {
        self.state.lock().direct_deps.iter().all(Vec::is_empty)
    }

    pub(crate) fn remove_reverse_dep(&self, parent: NodeId) {
        let mut state = self.state.lock();
        state.reverse_deps.retain(|id| *id != parent);
        if let Some(building) = state.building.as_mut() {
            building.reverse_deps_to_signal.retain(|id| *id != parent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FunctionName;

    const NODE: FunctionName = FunctionName::new("NODE");

    fn entry(id: usize) -> NodeEntry {
        NodeEntry::new(NodeId(id), Key::new(NODE, id))
    }

    #[test]
    fn test_registration_schedules_once() {
        let node = entry(0);
        assert_eq!(
            node.add_reverse_dep_and_check_if_done(None),
            DependencyState::NeedsScheduling
        );
        assert_eq!(
            node.add_reverse_dep_and_check_if_done(Some(NodeId(1))),
            DependencyState::AlreadyEvaluating
        );
        assert_eq!(node.in_progress_reverse_deps(), vec![NodeId(1)]);

        let outcome = node.set_value(Some(Value::new(1)), None, Version(1));
        assert_eq!(outcome.reverse_deps_to_signal, vec![NodeId(1)]);
        assert_eq!(outcome.version, Version(1));
        assert!(node.is_done());
        assert_eq!(
            node.add_reverse_dep_and_check_if_done(Some(NodeId(2))),
            DependencyState::Done
        );
        assert_eq!(node.reverse_deps(), vec![NodeId(1), NodeId(2)]);
    }

    #[test]
    fn test_signal_dep_readiness() {
        let node = entry(0);
        node.add_reverse_dep_and_check_if_done(None);
        node.add_temporary_direct_deps(vec![NodeId(1), NodeId(2)]);
        assert!(!node.signal_dep(Version(1)));
        assert!(node.signal_dep(Version(1)));
    }

    #[test]
    fn test_change_pruning_keeps_version() {
        let node = entry(0);
        node.add_reverse_dep_and_check_if_done(None);
        node.set_value(Some(Value::new(7)), None, Version(1));

        assert!(node.mark_dirty(true).is_some());
        assert_eq!(node.dirty_state(), DirtyState::NeedsRebuilding);
        node.add_reverse_dep_and_check_if_done(None);
        node.mark_rebuilding();
        let outcome = node.set_value(Some(Value::new(7)), None, Version(2));
        assert_eq!(outcome.version, Version(1));
        assert_eq!(node.dirty_state(), DirtyState::Done);

        node.mark_dirty(true);
        node.add_reverse_dep_and_check_if_done(None);
        node.mark_rebuilding();
        let outcome = node.set_value(Some(Value::new(8)), None, Version(3));
        assert_eq!(outcome.version, Version(3));
    }

    #[test]
    fn test_dirty_check_marks_clean() {
        let node = entry(0);
        node.add_reverse_dep_and_check_if_done(None);
        node.add_temporary_direct_deps(vec![NodeId(1)]);
        node.signal_dep(Version(1));
        node.set_value(Some(Value::new(1)), None, Version(1));

        node.mark_dirty(false);
        node.add_reverse_dep_and_check_if_done(Some(NodeId(5)));
        assert_eq!(node.next_dirty_dep_group(), Some(vec![NodeId(1)]));
        // The dependency did not change since the last build.
        assert!(node.signal_dep(Version(1)));
        assert_eq!(node.dirty_state(), DirtyState::CheckDependencies);
        assert_eq!(node.next_dirty_dep_group(), None);
        assert_eq!(node.mark_clean(Version(2)), vec![NodeId(5)]);
        assert_eq!(node.version(), Version(1));
        assert!(node.is_done());
    }

    #[test]
    fn test_dirty_check_detects_change() {
        let node = entry(0);
        node.add_reverse_dep_and_check_if_done(None);
        node.add_temporary_direct_deps(vec![NodeId(1)]);
        node.signal_dep(Version(1));
        node.set_value(Some(Value::new(1)), None, Version(1));

        node.mark_dirty(false);
        node.add_reverse_dep_and_check_if_done(None);
        node.next_dirty_dep_group();
        node.signal_dep(Version(2));
        assert_eq!(node.dirty_state(), DirtyState::NeedsRebuilding);
    }

    #[test]
    fn test_removed_deps_reported() {
        let node = entry(0);
        node.add_reverse_dep_and_check_if_done(None);
        node.add_temporary_direct_deps(vec![NodeId(1), NodeId(2)]);
        node.signal_dep(Version(1));
        node.signal_dep(Version(1));
        node.set_value(Some(Value::new(1)), None, Version(1));

        node.mark_dirty(true);
        node.add_reverse_dep_and_check_if_done(None);
        node.mark_rebuilding();
        node.add_temporary_direct_deps(vec![NodeId(2)]);
        node.signal_dep(Version(1));
        let outcome = node.set_value(Some(Value::new(2)), None, Version(2));
        assert_eq!(outcome.removed_deps, vec![NodeId(1)]);
    }

    #[test]
    #[should_panic(expected = "unsignaled dependencies")]
    fn test_commit_requires_signaled_deps() {
        let node = entry(0);
        node.add_reverse_dep_and_check_if_done(None);
        node.add_temporary_direct_deps(vec![NodeId(1)]);
        node.set_value(Some(Value::new(1)), None, Version(1));
    }

    #[test]
    #[should_panic(expected = "dirtied while evaluating")]
    fn test_mark_dirty_while_evaluating() {
        let node = entry(0);
        node.add_reverse_dep_and_check_if_done(None);
        node.mark_dirty(true);
    }
}
