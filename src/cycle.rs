//! Cycle detection for requested keys that never completed.

use std::collections::HashSet;
use std::sync::Arc;

use crate::{
    CycleInfo, ErrorInfo, EvaluationResultBuilder, EvaluatorContext, InMemoryGraph, Key, NodeId,
};

/// Explains why requested keys did not complete.
///
/// Called only for keys that have neither a value nor an error after the
/// evaluation ended and no error bubbling explains them.
pub trait CycleDetector: Send + Sync + 'static {
    /// Records an error, and a cycle root where a cycle is found, for each of
    /// `roots` it can explain.
    fn check_for_cycles(
        &self,
        roots: &[Key],
        result: &mut EvaluationResultBuilder,
        ctx: &EvaluatorContext,
    );
}

/// Depth-first search over the dependencies registered by unfinished nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleCycleDetector;

struct Frame {
    id: NodeId,
    deps: Vec<NodeId>,
    next: usize,
}

impl SimpleCycleDetector {
    fn explore(graph: &InMemoryGraph, root: &Key) -> (Vec<CycleInfo>, Vec<Arc<ErrorInfo>>) {
        let mut cycles = Vec::new();
        let mut child_errors: Vec<Arc<ErrorInfo>> = Vec::new();
        let Some(entry) = graph.get(root) else {
            return (cycles, child_errors);
        };
        if entry.is_done() {
            return (cycles, child_errors);
        }

        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut errors_seen: HashSet<NodeId> = HashSet::new();
        let mut path: Vec<Frame> = Vec::new();
        visited.insert(entry.id());
        path.push(Frame {
            id: entry.id(),
            deps: entry.temporary_direct_deps().into_iter().flatten().collect(),
            next: 0,
        });

        while let Some(frame) = path.last_mut() {
            let Some(&dep_id) = frame.deps.get(frame.next) else {
                path.pop();
                continue;
            };
            frame.next += 1;

            if let Some(pos) = path.iter().position(|frame| frame.id == dep_id) {
                let keys: Vec<Key> = path
                    .iter()
                    .map(|frame| graph.entry(frame.id).key().clone())
                    .collect();
                let cycle = CycleInfo::new(keys[..pos].to_vec(), keys[pos..].to_vec());
                tracing::debug!(root = ?root, %cycle, "cycle detected");
                cycles.push(cycle);
                continue;
            }
            let dep = graph.entry(dep_id);
            if dep.is_done() {
                if let Some(error) = dep.error_info() {
                    if errors_seen.insert(dep_id) {
                        child_errors.push(error);
                    }
                }
                continue;
            }
            if visited.insert(dep_id) {
                path.push(Frame {
                    id: dep_id,
                    deps: dep.temporary_direct_deps().into_iter().flatten().collect(),
                    next: 0,
                });
            }
        }
        (cycles, child_errors)
    }
}

impl CycleDetector for SimpleCycleDetector {
    fn check_for_cycles(
        &self,
        roots: &[Key],
        result: &mut EvaluationResultBuilder,
        ctx: &EvaluatorContext,
    ) {
        for root in roots {
            let (cycles, child_errors) = Self::explore(ctx.graph(), root);
            if !cycles.is_empty() {
                result.add_error(root.clone(), Arc::new(ErrorInfo::from_cycles(cycles)));
                result.add_cycle_root(root.clone());
            } else if !child_errors.is_empty() {
                let info = ErrorInfo::from_child_errors(root, child_errors.iter().map(|e| &**e));
                result.add_error(root.clone(), Arc::new(info));
            }
        }
    }
}
