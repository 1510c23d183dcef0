//! The parallel evaluator: scheduling, error bubbling and result construction.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::context::Evaluation;
use crate::evaluate::enqueue_evaluation;
use crate::progress::InflightNodes;
use crate::scheduler::{panic_message, Completion, NodeVisitor, SchedulerAbort};
use crate::{
    ComputeError, CycleDetector, DependencyState, Environment, ErrorInfo, ErrorTransienceValue,
    EvalError, EvaluationProgressReceiver, EvaluationResult, EvaluationResultBuilder,
    EvaluationState, EvaluatorContext, InMemoryGraph, InterruptKind, Key, NodeEntry, Value,
    Version,
};

/// Evaluates requested keys at one version of the graph, computing whatever is
/// not done yet on the worker pool.
pub struct ParallelEvaluator {
    ctx: EvaluatorContext,
    cycle_detector: Arc<dyn CycleDetector>,
    inflight: Arc<InflightNodes>,
}

impl ParallelEvaluator {
    pub fn new(ctx: EvaluatorContext, cycle_detector: Arc<dyn CycleDetector>) -> Self {
        Self {
            ctx,
            cycle_detector,
            inflight: Arc::new(InflightNodes::default()),
        }
    }

    pub fn context(&self) -> &EvaluatorContext {
        &self.ctx
    }

    /// Keys that were scheduled but did not finish, because of a cycle or an abort.
    pub fn inflight_keys(&self) -> Vec<Key> {
        self.inflight.keys()
    }

    /// Evaluates `keys`, returning a value, an error or a cycle for each of them.
    ///
    /// Returns [`EvalError::Interrupted`] if the evaluation was cancelled and
    /// [`EvalError::Crashed`] if a node function panicked.
    pub fn eval(&self, keys: &[Key]) -> Result<EvaluationResult, EvalError> {
        let mut unique = Vec::with_capacity(keys.len());
        for key in keys {
            if !unique.contains(key) {
                unique.push(key.clone());
            }
        }
        let keys = unique;
        let graph = self.ctx.graph();

        // Everything requested is done: skip scheduling entirely.
        let entries = graph.get_batch(&keys);
        if entries
            .iter()
            .all(|entry| entry.as_ref().is_some_and(|entry| entry.is_done()))
        {
            tracing::debug!(keys = keys.len(), version = %self.ctx.version(), "all requested keys done");
            for entry in entries.iter().flatten() {
                self.inform_progress_receiver_that_value_is_done(entry);
            }
            return Ok(self.construct_result(&keys, None, None));
        }

        // Errors, even cached ones, halt a fail-fast evaluation.
        if !self.ctx.keep_going() {
            let cached_errors: Vec<Key> = entries
                .iter()
                .flatten()
                .filter(|entry| entry.is_done() && entry.error_info().is_some())
                .map(|entry| {
                    self.inform_progress_receiver_that_value_is_done(entry);
                    entry.key().clone()
                })
                .collect();
            if !cached_errors.is_empty() {
                tracing::debug!(errors = cached_errors.len(), "cached errors halt evaluation");
                return Ok(self.construct_result(&cached_errors, None, None));
            }
        }

        self.do_mutating_evaluation(&keys)
    }

    fn do_mutating_evaluation(&self, keys: &[Key]) -> Result<EvaluationResult, EvalError> {
        let graph = self.ctx.graph();
        // Created up front so that transient failures never race to create it.
        let sentinel = graph.create_if_absent(&Key::error_transience());
        if !sentinel.is_done() {
            inject_values(
                vec![(Key::error_transience(), Value::new(ErrorTransienceValue))],
                self.ctx.version(),
                graph,
                self.ctx.receiver(),
            );
        }

        let evaluation = Evaluation {
            ctx: self.ctx.clone(),
            visitor: Arc::new(NodeVisitor::new(self.ctx.pool().clone())),
            inflight: self.inflight.clone(),
        };
        tracing::debug!(keys = keys.len(), version = %self.ctx.version(), "starting evaluation");
        for entry in graph.create_if_absent_batch(keys) {
            match entry.add_reverse_dep_and_check_if_done(None) {
                DependencyState::NeedsScheduling => enqueue_evaluation(&evaluation, &entry),
                DependencyState::Done => self.inform_progress_receiver_that_value_is_done(&entry),
                DependencyState::AlreadyEvaluating => {}
            }
        }
        self.wait_for_completion_and_construct_result(&evaluation, keys)
    }

    fn wait_for_completion_and_construct_result(
        &self,
        evaluation: &Evaluation,
        keys: &[Key],
    ) -> Result<EvaluationResult, EvalError> {
        let completion = evaluation.visitor.wait_for_completion();
        if let Some(crash) = evaluation.visitor.take_crashes().into_iter().next() {
            return Err(EvalError::Crashed {
                key: crash.key,
                message: crash.message,
            });
        }
        // A cancellation seen by no worker, such as one made while the last
        // node was running, still interrupts the evaluation.
        if self.ctx.cancellation().is_cancelled() {
            tracing::debug!("evaluation cancelled");
            return Err(EvalError::Interrupted);
        }
        match completion {
            Completion::Completed => Ok(self.construct_result(keys, None, None)),
            Completion::Interrupted => {
                tracing::debug!("evaluation interrupted");
                Err(EvalError::Interrupted)
            }
            Completion::Aborted(abort) => {
                if self.ctx.keep_going() {
                    assert!(
                        abort.error_info.is_catastrophic(),
                        "scheduling aborted without catastrophe in keep-going evaluation: {:?}",
                        abort.failed_key
                    );
                }
                let bubbled = self.bubble_error_up(&abort, keys)?;
                Ok(self.construct_result(keys, bubbled.as_ref(), Some(&abort)))
            }
        }
    }

    /// Walks from the failed key up through in-progress parents to a requested
    /// key, recomputing each parent with the error in view so it can add context.
    ///
    /// Returns the errors synthesized on the way, the failed key included, or
    /// `None` if the walk ran into a cycle.
    fn bubble_error_up(
        &self,
        abort: &SchedulerAbort,
        roots: &[Key],
    ) -> Result<Option<HashMap<Key, Arc<ErrorInfo>>>, EvalError> {
        let graph = self.ctx.graph();
        let cancellation = self.ctx.cancellation();
        let mut error = abort.error_info.clone();
        let mut error_key = abort.failed_key.clone();
        let mut bubbled = HashMap::new();
        bubbled.insert(error_key.clone(), error.clone());
        let mut external_interrupt = false;
        let mut first_iteration = true;

        loop {
            let error_entry = graph
                .get(&error_key)
                .unwrap_or_else(|| panic!("{:?} not in graph", error_key));
            let parents: Vec<Key> = if error_entry.is_done() {
                assert!(first_iteration, "non-leaf done node reached: {:?}", error_key);
                abort.rdeps_to_bubble_up_to.clone()
            } else {
                assert!(!first_iteration, "failed node {:?} is not done", error_key);
                error_entry
                    .in_progress_reverse_deps()
                    .into_iter()
                    .map(|id| graph.entry(id).key().clone())
                    .collect()
            };
            first_iteration = false;

            // Any parent will do. Simultaneous failures may pick different paths.
            let Some(parent) = parents.into_iter().next() else {
                assert!(
                    roots.contains(&error_key),
                    "{:?} has no parents but was not requested",
                    error_key
                );
                break;
            };
            if bubbled.contains_key(&parent) {
                tracing::debug!(key = ?parent, "cycle found while bubbling error");
                return Ok(None);
            }
            let parent_entry = graph
                .get(&parent)
                .unwrap_or_else(|| panic!("parent {:?} of {:?} not in graph", parent, error_key));
            assert!(
                !parent_entry.is_done(),
                "cannot bubble into done node {:?}",
                parent
            );
            assert!(
                self.inflight.contains(parent_entry.id()),
                "in-progress reverse dep {:?} is not in flight",
                parent
            );
            assert!(
                parent_entry.temporary_direct_deps_contain(error_entry.id()),
                "{:?} did not declare a dependency on {:?}",
                parent,
                error_key
            );
            if parent_entry.is_dirty() {
                parent_entry.force_rebuild();
            }

            tracing::debug!(key = ?parent, child = ?error_key, "bubbling error");
            error_key = parent.clone();
            let function = self
                .ctx
                .functions()
                .get(parent.function())
                .unwrap_or_else(|| panic!("no function registered for {}", parent.function()));
            external_interrupt |= cancellation.is_cancelled();
            let mut env = Environment::bubbling(graph, cancellation, &bubbled);
            let result = catch_unwind(AssertUnwindSafe(|| function.compute(&parent, &mut env)));
            drop(env);
            let result = result.map_err(|payload| EvalError::Crashed {
                key: parent.clone(),
                message: panic_message(payload.as_ref()),
            })?;

            match result {
                Err(ComputeError::Failed(failure)) => {
                    // The parent blames itself. A catastrophe stays one on its way up.
                    let failure = if error.is_catastrophic() {
                        failure.catastrophic()
                    } else {
                        failure
                    };
                    error = Arc::new(ErrorInfo::from_failure(parent.clone(), &failure));
                }
                Err(ComputeError::Interrupted(InterruptKind::External)) => {
                    external_interrupt = true;
                }
                _ => {}
            }
            let info = ErrorInfo::from_child_errors(&parent, [&*error]);
            bubbled.insert(parent, Arc::new(info));
        }

        if external_interrupt {
            return Err(EvalError::Interrupted);
        }
        Ok(Some(bubbled))
    }

    fn construct_result(
        &self,
        keys: &[Key],
        bubbled: Option<&HashMap<Key, Arc<ErrorInfo>>>,
        abort: Option<&SchedulerAbort>,
    ) -> EvaluationResult {
        let graph = self.ctx.graph();
        let mut result = EvaluationResultBuilder::new();
        let mut cycle_roots = Vec::new();

        for key in keys {
            if let Some(error) = bubbled.and_then(|bubbled| bubbled.get(key)) {
                result.add_error(key.clone(), error.clone());
                continue;
            }
            let Some(entry) = graph.get(key).filter(|entry| entry.is_done()) else {
                // An explained failure is no evidence of a cycle.
                if bubbled.is_none() {
                    cycle_roots.push(key.clone());
                }
                continue;
            };
            if let Some(error) = entry.error_info() {
                result.add_error(key.clone(), error);
            } else if let Some(value) = entry.value() {
                result.add_result(key.clone(), value);
            } else {
                panic!("done node {:?} has neither value nor error", key);
            }
        }

        if !cycle_roots.is_empty() {
            tracing::debug!(candidates = cycle_roots.len(), "checking for cycles");
            self.cycle_detector
                .check_for_cycles(&cycle_roots, &mut result, &self.ctx);
        }

        for key in keys {
            if result.contains(key) {
                continue;
            }
            let Some(abort) = abort else {
                panic!("{:?} did not complete and is not part of a cycle", key);
            };
            let info = ErrorInfo::from_child_errors(key, [&*abort.error_info]);
            result.add_error(key.clone(), Arc::new(info));
        }

        if let Some(abort) = abort.filter(|_| self.ctx.keep_going()) {
            let exception = match bubbled {
                Some(bubbled) => bubbled
                    .values()
                    .find(|info| info.is_catastrophic())
                    .unwrap_or_else(|| panic!("no catastrophic error among bubbled errors"))
                    .exception()
                    .cloned(),
                None => abort.error_info.exception().cloned(),
            };
            if let Some(exception) = exception {
                result.set_catastrophe(exception);
            }
        }

        assert!(
            bubbled.is_none() || result.has_error(),
            "an error bubbled up but no requested key is in error"
        );
        result.build()
    }

    fn inform_progress_receiver_that_value_is_done(&self, entry: &NodeEntry) {
        assert!(entry.is_done(), "{:?} is not done", entry.key());
        let version = entry.version();
        assert!(
            version.at_most(self.ctx.version()),
            "{} should be at most {}",
            version,
            self.ctx.version()
        );
        let state = if version == self.ctx.version() {
            EvaluationState::Built
        } else {
            EvaluationState::Clean
        };
        let value = entry.value().filter(|_| entry.error_info().is_none());
        self.ctx
            .receiver()
            .evaluated(entry.key(), value.as_ref(), state);
    }
}

/// Sets externally supplied leaf values at `version`.
///
/// # Panics
///
/// Panics if a node is being evaluated, is done without having been
/// invalidated, or declared dependencies in its last build.
pub fn inject_values(
    values: Vec<(Key, Value)>,
    version: Version,
    graph: &InMemoryGraph,
    receiver: &dyn EvaluationProgressReceiver,
) {
    let keys: Vec<Key> = values.iter().map(|(key, _)| key.clone()).collect();
    let entries = graph.create_if_absent_batch(&keys);
    for ((key, value), entry) in values.into_iter().zip(entries) {
        let state = entry.add_reverse_dep_and_check_if_done(None);
        assert_ne!(
            state,
            DependencyState::AlreadyEvaluating,
            "{:?} injected while evaluating",
            key
        );
        if entry.is_dirty() {
            assert!(
                entry.no_deps_last_build(),
                "existing entry for {:?} has deps",
                key
            );
            entry.force_rebuild();
        }
        assert_eq!(
            state,
            DependencyState::NeedsScheduling,
            "{:?} must be invalidated before injection",
            key
        );
        entry.set_value(Some(value), None, version);
        tracing::trace!(key = ?key, version = %version, "injected");
        receiver.injected(&key);
    }
}
