use std::sync::Arc;

use parking_lot::Mutex;

use crate::evaluator::inject_values;
use crate::{
    BuildError, CancellationToken, ComputeError, CycleDetector, Environment, ErrorInfo,
    ErrorTransienceValue, EvalError, EvaluationProgressReceiver, EvaluationResult,
    EvaluatorContext, FunctionName, FunctionRegistry, InMemoryGraph, Key, NodeFunction,
    NoopProgressReceiver, ParallelEvaluator, SimpleCycleDetector, Value, Version,
};

/// Per-call evaluation settings.
#[derive(Debug, Clone, Default)]
pub struct EvaluationOptions {
    /// Continue past non-catastrophic errors and build as much as possible.
    pub keep_going: bool,
    /// Token to cancel the evaluation from another thread.
    pub cancellation: CancellationToken,
}

struct EvaluatorState {
    version: Version,
    pending_injections: Vec<(Key, Value)>,
    pending_invalidations: Vec<Key>,
    /// Keys left unfinished by the last evaluation.
    inflight: Vec<Key>,
}

/// Owns a graph across evaluations and keeps it consistent between them.
///
/// Each [`evaluate`](Self::evaluate) runs at a new version. Injections and
/// invalidations queued since the previous call are applied first, and nodes the
/// previous call left unfinished are deleted together with everything depending
/// on them.
pub struct MemoizingEvaluator {
    graph: Arc<InMemoryGraph>,
    functions: Arc<FunctionRegistry>,
    pool: Arc<rayon::ThreadPool>,
    receiver: Arc<dyn EvaluationProgressReceiver>,
    cycle_detector: Arc<dyn CycleDetector>,
    state: Mutex<EvaluatorState>,
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<MemoizingEvaluator>();
    assert_sync::<MemoizingEvaluator>();
}

impl MemoizingEvaluator {
    /// Create a builder for configuring an evaluator.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let evaluator = MemoizingEvaluator::builder()
    ///     .function(DOUBLE, |key, env| { ... })
    ///     .threads(4)
    ///     .build()?;
    /// ```
    pub fn builder() -> MemoizingEvaluatorBuilder {
        MemoizingEvaluatorBuilder::new()
    }

    /// Queue leaf values to be set at the next evaluation.
    pub fn inject(&self, values: impl IntoIterator<Item = (Key, Value)>) {
        self.state.lock().pending_injections.extend(values);
    }

    /// Queue keys to be marked changed at the next evaluation.
    ///
    /// The keys are recomputed by their functions, so injected leaves should be
    /// re-injected rather than invalidated.
    pub fn invalidate(&self, keys: impl IntoIterator<Item = Key>) {
        self.state.lock().pending_invalidations.extend(keys);
    }

    /// Evaluate `keys` at a new version.
    ///
    /// Calls are serialized: a second caller waits for the running evaluation.
    pub fn evaluate(
        &self,
        keys: &[Key],
        options: &EvaluationOptions,
    ) -> Result<EvaluationResult, EvalError> {
        let mut state = self.state.lock();
        state.version = state.version.next();
        let version = state.version;

        if !state.inflight.is_empty() {
            let removed = self.graph.remove_recursive(&state.inflight);
            tracing::debug!(removed = removed.len(), "removed unfinished nodes");
            state.inflight.clear();
        }

        let invalidations = std::mem::take(&mut state.pending_invalidations);
        let mut injections: Vec<(Key, Value)> = Vec::new();
        for (key, value) in std::mem::take(&mut state.pending_injections) {
            injections.retain(|(existing, _)| *existing != key);
            injections.push((key, value));
        }
        // Injecting an equal value would only dirty the parents.
        injections.retain(|(key, value)| {
            invalidations.contains(key)
                || !self.graph.get(key).is_some_and(|entry| {
                    entry.is_done()
                        && entry.error_info().is_none()
                        && entry.value().as_ref() == Some(value)
                })
        });

        let mut changed = invalidations;
        changed.extend(
            injections
                .iter()
                .filter(|(key, _)| self.graph.get(key).is_some())
                .map(|(key, _)| key.clone()),
        );
        // Transient errors depend on the sentinel, so they are retried every time.
        changed.push(Key::error_transience());
        self.graph.invalidate(&changed, true, &*self.receiver);

        injections.push((Key::error_transience(), Value::new(ErrorTransienceValue)));
        inject_values(injections, version, &self.graph, &*self.receiver);

        let ctx = EvaluatorContext::new(
            self.graph.clone(),
            version,
            self.functions.clone(),
            self.pool.clone(),
        )
        .with_keep_going(options.keep_going)
        .with_progress_receiver(self.receiver.clone())
        .with_cancellation(options.cancellation.clone());
        let evaluator = ParallelEvaluator::new(ctx, self.cycle_detector.clone());
        let result = evaluator.eval(keys);
        state.inflight = evaluator.inflight_keys();
        result
    }

    /// The value of a done node without error.
    pub fn get_value(&self, key: &Key) -> Option<Value> {
        let entry = self.graph.get(key)?;
        if !entry.is_done() || entry.error_info().is_some() {
            return None;
        }
        entry.value()
    }

    /// The error of a done node.
    pub fn get_error(&self, key: &Key) -> Option<Arc<ErrorInfo>> {
        let entry = self.graph.get(key)?;
        if !entry.is_done() {
            return None;
        }
        entry.error_info()
    }

    /// Version of the last evaluation.
    pub fn current_version(&self) -> Version {
        self.state.lock().version
    }

    pub fn graph(&self) -> &Arc<InMemoryGraph> {
        &self.graph
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`MemoizingEvaluator`].
pub struct MemoizingEvaluatorBuilder {
    functions: FunctionRegistry,
    threads: usize,
    pool: Option<Arc<rayon::ThreadPool>>,
    receiver: Arc<dyn EvaluationProgressReceiver>,
    cycle_detector: Arc<dyn CycleDetector>,
}

impl Default for MemoizingEvaluatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoizingEvaluatorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            functions: FunctionRegistry::new(),
            threads: 0,
            pool: None,
            receiver: Arc::new(NoopProgressReceiver),
            cycle_detector: Arc::new(SimpleCycleDetector),
        }
    }

    /// Register the function computing keys of the family `name`.
    pub fn function<F>(mut self, name: FunctionName, function: F) -> Self
    where
        F: Fn(&Key, &mut Environment<'_>) -> Result<Value, ComputeError> + Send + Sync + 'static,
    {
        self.functions.register(name, function);
        self
    }

    /// Register an already shared function.
    pub fn node_function(mut self, name: FunctionName, function: Arc<dyn NodeFunction>) -> Self {
        self.functions.insert(name, function);
        self
    }

    /// Number of worker threads. `0`, the default, lets rayon decide.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Run on an existing pool instead of creating one.
    pub fn pool(mut self, pool: Arc<rayon::ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn progress_receiver(mut self, receiver: Arc<dyn EvaluationProgressReceiver>) -> Self {
        self.receiver = receiver;
        self
    }

    pub fn cycle_detector(mut self, cycle_detector: Arc<dyn CycleDetector>) -> Self {
        self.cycle_detector = cycle_detector;
        self
    }

    /// Build the evaluator with the configured settings.
    pub fn build(self) -> Result<MemoizingEvaluator, BuildError> {
        let pool = match self.pool {
            Some(pool) => pool,
            None => Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(self.threads)
                    .thread_name(|index| format!("eval-flow-{}", index))
                    .build()?,
            ),
        };
        Ok(MemoizingEvaluator {
            graph: Arc::new(InMemoryGraph::new()),
            functions: Arc::new(self.functions),
            pool,
            receiver: self.receiver,
            cycle_detector: self.cycle_detector,
            state: Mutex::new(EvaluatorState {
                version: Version::MINIMAL,
                pending_injections: Vec::new(),
                pending_invalidations: Vec::new(),
                inflight: Vec::new(),
            }),
        })
    }
}
