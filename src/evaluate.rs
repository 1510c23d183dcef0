//! The evaluation step run on the worker pool for one node.

use std::sync::Arc;

use crate::context::Evaluation;
use crate::function::{EnvironmentOutcome, RequestedDep};
use crate::scheduler::SchedulerAbort;
use crate::{
    ComputeError, DependencyState, DirtyState, Environment, ErrorInfo, EvaluationState,
    InterruptKind, Key, NodeEntry, NodeId, Value, Version,
};

/// Hands a node to the worker pool.
pub(crate) fn enqueue_evaluation(evaluation: &Evaluation, entry: &NodeEntry) {
    evaluation.inflight.insert(entry.id(), entry.key().clone());
    evaluation.ctx.receiver().enqueueing(entry.key());
    let task = evaluation.clone();
    let id = entry.id();
    evaluation
        .visitor
        .spawn(entry.key().clone(), move || evaluate_node(&task, id));
}

fn evaluate_node(evaluation: &Evaluation, id: NodeId) {
    let ctx = &evaluation.ctx;
    if ctx.cancellation().is_cancelled() {
        evaluation.visitor.halt_interrupted();
        return;
    }
    if evaluation.visitor.is_halted() {
        return;
    }
    let entry = ctx.graph().entry(id);

    match entry.dirty_state() {
        DirtyState::CheckDependencies => {
            match entry.next_dirty_dep_group() {
                Some(group) => {
                    tracing::trace!(key = ?entry.key(), deps = group.len(), "checking dependencies");
                    let deps: Vec<_> = group.into_iter().map(|id| ctx.graph().entry(id)).collect();
                    register_deps(evaluation, &entry, &deps);
                }
                None => {
                    tracing::trace!(key = ?entry.key(), "clean");
                    let parents = entry.mark_clean(ctx.version());
                    evaluation.inflight.remove(id);
                    let value = entry.value();
                    let error = entry.error_info();
                    ctx.receiver().evaluated(
                        entry.key(),
                        value.as_ref().filter(|_| error.is_none()),
                        EvaluationState::Clean,
                    );
                    complete(evaluation, &entry, parents, entry.version(), error);
                }
            }
            return;
        }
        DirtyState::NeedsRebuilding => entry.mark_rebuilding(),
        _ => {}
    }

    compute(evaluation, &entry);
}

fn compute(evaluation: &Evaluation, entry: &Arc<NodeEntry>) {
    let ctx = &evaluation.ctx;
    let key = entry.key();
    let Some(function) = ctx.functions().get(key.function()) else {
        panic!("no function registered for {}", key.function());
    };

    tracing::trace!(key = ?key, "computing");
    let mut env = Environment::building(
        ctx.graph(),
        ctx.cancellation(),
        entry,
        &evaluation.visitor,
    );
    let result = function.compute(key, &mut env);
    let outcome = env.finish();

    match result {
        Err(ComputeError::Interrupted(InterruptKind::External)) => {
            evaluation.visitor.halt_interrupted();
            return;
        }
        Err(ComputeError::Interrupted(InterruptKind::Halted)) => {
            assert!(
                evaluation.visitor.is_halted(),
                "{:?} reported a halt but the evaluation was not halted",
                key
            );
            return;
        }
        _ => {}
    }

    if !ctx.keep_going() {
        if let Some((child, error)) = outcome.child_errors.first() {
            register_done_deps(evaluation, entry, &outcome);
            evaluation.visitor.halt_with_error(SchedulerAbort {
                failed_key: child.clone(),
                error_info: error.clone(),
                rdeps_to_bubble_up_to: vec![key.clone()],
            });
            return;
        }
    }

    // In keep-going mode an error is committed only once no requested
    // dependency is missing.
    let restart = ctx.keep_going()
        && outcome.values_missing
        && match &result {
            Err(ComputeError::Dependency { .. }) => true,
            Err(ComputeError::Failed(failure)) => !failure.is_catastrophic(),
            _ => false,
        };
    if restart {
        tracing::trace!(key = ?key, "error with missing dependencies, restarting");
        register_new_deps(evaluation, entry, &outcome);
        return;
    }

    match result {
        Ok(value) => {
            assert!(
                !outcome.values_missing,
                "{:?} returned a value although dependencies were missing",
                key
            );
            register_done_deps(evaluation, entry, &outcome);
            commit(evaluation, entry, Some(value), None);
        }
        Err(ComputeError::Missing) => {
            assert!(
                outcome.values_missing,
                "{:?} reported missing dependencies but none were missing",
                key
            );
            register_new_deps(evaluation, entry, &outcome);
        }
        Err(ComputeError::Dependency { key: child, error }) => {
            let info = if outcome.child_errors.is_empty() {
                ErrorInfo::from_child_errors(key, [&*error])
            } else {
                ErrorInfo::from_child_errors(key, outcome.child_errors.iter().map(|(_, e)| &**e))
            };
            tracing::trace!(key = ?key, child = ?child, "dependency failed");
            register_done_deps(evaluation, entry, &outcome);
            commit(evaluation, entry, None, Some(info));
        }
        Err(ComputeError::Failed(failure)) => {
            tracing::debug!(key = ?key, error = %failure.error(), "node function failed");
            register_done_deps(evaluation, entry, &outcome);
            if failure.is_transient() {
                let sentinel = ctx.graph().create_if_absent(&Key::error_transience());
                if !entry.temporary_direct_deps_contain(sentinel.id()) {
                    entry.add_temporary_direct_deps(vec![sentinel.id()]);
                    register_done(entry, &sentinel);
                }
            }
            let info = ErrorInfo::from_failure(key.clone(), &failure);
            commit(evaluation, entry, None, Some(info));
        }
        Err(ComputeError::Interrupted(_)) => unreachable!("handled above"),
    }
}

/// Adds every newly requested group to the node and registers it on them. The
/// node is enqueued again once all of them are done.
fn register_new_deps(evaluation: &Evaluation, entry: &NodeEntry, outcome: &EnvironmentOutcome) {
    let graph = evaluation.ctx.graph();
    let groups: Vec<Vec<Arc<NodeEntry>>> = outcome
        .new_deps
        .iter()
        .map(|group| {
            let keys: Vec<Key> = group.iter().map(|dep| dep.key.clone()).collect();
            graph.create_if_absent_batch(&keys)
        })
        .collect();
    // Every group must be known before any dependency can signal.
    for group in &groups {
        entry.add_temporary_direct_deps(group.iter().map(|dep| dep.id()).collect());
    }
    let deps: Vec<_> = groups.into_iter().flatten().collect();
    tracing::trace!(key = ?entry.key(), deps = deps.len(), "waiting for dependencies");
    register_deps(evaluation, entry, &deps);
}

/// Registers `entry` on each of `deps`, enqueueing the ones not yet scheduled and
/// `entry` itself once the last of them has signalled.
fn register_deps(evaluation: &Evaluation, entry: &NodeEntry, deps: &[Arc<NodeEntry>]) {
    for dep in deps {
        match dep.add_reverse_dep_and_check_if_done(Some(entry.id())) {
            DependencyState::Done => {
                if entry.signal_dep(dep.version()) {
                    enqueue_evaluation(evaluation, entry);
                }
            }
            DependencyState::NeedsScheduling => enqueue_evaluation(evaluation, dep),
            DependencyState::AlreadyEvaluating => {}
        }
    }
}

/// Adds the requested dependencies that were done to the node, dropping the rest.
fn register_done_deps(evaluation: &Evaluation, entry: &NodeEntry, outcome: &EnvironmentOutcome) {
    let graph = evaluation.ctx.graph();
    for group in &outcome.new_deps {
        let done: Vec<&RequestedDep> = group.iter().filter(|dep| dep.done).collect();
        let deps: Vec<Arc<NodeEntry>> = done
            .iter()
            .filter_map(|dep| graph.get(&dep.key))
            .collect();
        entry.add_temporary_direct_deps(deps.iter().map(|dep| dep.id()).collect());
        for dep in &deps {
            register_done(entry, dep);
        }
    }
}

fn register_done(entry: &NodeEntry, dep: &NodeEntry) {
    let state = dep.add_reverse_dep_and_check_if_done(Some(entry.id()));
    assert_eq!(
        state,
        DependencyState::Done,
        "{:?} read {:?} as done",
        entry.key(),
        dep.key()
    );
    entry.signal_dep(dep.version());
}

fn commit(
    evaluation: &Evaluation,
    entry: &NodeEntry,
    value: Option<Value>,
    error: Option<ErrorInfo>,
) {
    let ctx = &evaluation.ctx;
    let error = error.map(Arc::new);
    let outcome = entry.set_value(value, error.clone(), ctx.version());
    for dep in outcome.removed_deps {
        ctx.graph().entry(dep).remove_reverse_dep(entry.id());
    }
    evaluation.inflight.remove(entry.id());

    let value = entry.value().filter(|_| error.is_none());
    ctx.receiver()
        .evaluated(entry.key(), value.as_ref(), EvaluationState::Built);
    complete(
        evaluation,
        entry,
        outcome.reverse_deps_to_signal,
        outcome.version,
        error,
    );
}

/// Signals the parents of a node that just became done, or aborts scheduling if
/// its error must stop the evaluation.
fn complete(
    evaluation: &Evaluation,
    entry: &NodeEntry,
    parents: Vec<NodeId>,
    version: Version,
    error: Option<Arc<ErrorInfo>>,
) {
    let ctx = &evaluation.ctx;
    if let Some(error) = error {
        if !ctx.keep_going() || error.is_catastrophic() {
            let rdeps_to_bubble_up_to = parents
                .iter()
                .map(|id| ctx.graph().entry(*id).key().clone())
                .collect();
            evaluation.visitor.halt_with_error(SchedulerAbort {
                failed_key: entry.key().clone(),
                error_info: error,
                rdeps_to_bubble_up_to,
            });
            return;
        }
    }
    for parent in parents {
        let parent = ctx.graph().entry(parent);
        if parent.signal_dep(version) {
            enqueue_evaluation(evaluation, &parent);
        }
    }
}
