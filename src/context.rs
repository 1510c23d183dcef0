use std::sync::Arc;

use crate::progress::InflightNodes;
use crate::scheduler::NodeVisitor;
use crate::{
    CancellationToken, EvaluationProgressReceiver, FunctionRegistry, InMemoryGraph,
    NoopProgressReceiver, Version,
};

/// Everything one evaluation runs with: the graph, the version it evaluates at,
/// the error policy and the observer.
#[derive(Clone)]
pub struct EvaluatorContext {
    graph: Arc<InMemoryGraph>,
    version: Version,
    functions: Arc<FunctionRegistry>,
    keep_going: bool,
    receiver: Arc<dyn EvaluationProgressReceiver>,
    cancellation: CancellationToken,
    pool: Arc<rayon::ThreadPool>,
}

impl EvaluatorContext {
    /// Create a fail-fast context without observer.
    pub fn new(
        graph: Arc<InMemoryGraph>,
        version: Version,
        functions: Arc<FunctionRegistry>,
        pool: Arc<rayon::ThreadPool>,
    ) -> Self {
        Self {
            graph,
            version,
            functions,
            keep_going: false,
            receiver: Arc::new(NoopProgressReceiver),
            cancellation: CancellationToken::new(),
            pool,
        }
    }

    /// Continue past non-catastrophic errors.
    pub fn with_keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    pub fn with_progress_receiver(mut self, receiver: Arc<dyn EvaluationProgressReceiver>) -> Self {
        self.receiver = receiver;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn graph(&self) -> &Arc<InMemoryGraph> {
        &self.graph
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn keep_going(&self) -> bool {
        self.keep_going
    }

    pub fn receiver(&self) -> &dyn EvaluationProgressReceiver {
        &*self.receiver
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub(crate) fn pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.pool
    }
}

/// State shared by the workers of one mutating evaluation.
#[derive(Clone)]
pub(crate) struct Evaluation {
    pub ctx: EvaluatorContext,
    pub visitor: Arc<NodeVisitor>,
    pub inflight: Arc<InflightNodes>,
}
