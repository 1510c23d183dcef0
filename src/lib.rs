//! Eval-Flow: a parallel, incremental evaluator for graphs of memoized computations.
//!
//! Every node of the graph is addressed by a [`Key`] and computed by the
//! [`NodeFunction`] registered for the key's [`FunctionName`]. Functions request
//! their dependencies through an [`Environment`]; dependencies that are not done
//! yet are scheduled on a worker pool and the function is restarted once they are.
//!
//! # Key Features
//!
//! - **Parallel**: independent nodes are computed concurrently on a rayon pool
//! - **Incremental**: values persist across evaluations; invalidated nodes check
//!   their dependencies and are only recomputed if one of them changed
//! - **Change pruning**: a recomputed node with an equal value keeps its version
//! - **Fail-fast or keep-going**: stop at the first error, or build as much as possible
//! - **Error bubbling**: failures are reported through the requested keys, each
//!   parent on the way getting a chance to add context
//! - **Cycle detection**: keys stuck in a dependency cycle are reported with the cycle
//!
//! # Example
//!
//! ```ignore
//! use eval_flow::{ComputeError, EvaluationOptions, FunctionName, Key, MemoizingEvaluator, Value};
//!
//! const INPUT: FunctionName = FunctionName::new("INPUT");
//! const DOUBLE: FunctionName = FunctionName::new("DOUBLE");
//!
//! let evaluator = MemoizingEvaluator::builder()
//!     .function(DOUBLE, |key, env| {
//!         let name = key.argument::<&str>().unwrap();
//!         let Some(input) = env.get(&Key::new(INPUT, *name))? else {
//!             return Err(ComputeError::Missing);
//!         };
//!         Ok(Value::new(input.downcast_ref::<i32>().unwrap() * 2))
//!     })
//!     .build()?;
//!
//! evaluator.inject([(Key::new(INPUT, "x"), Value::new(21))]);
//! let result = evaluator.evaluate(&[Key::new(DOUBLE, "x")], &EvaluationOptions::default())?;
//! assert_eq!(result.get_as::<i32>(&Key::new(DOUBLE, "x")), Some(&42));
//! ```

mod cancel;
mod context;
mod cycle;
mod error;
mod evaluate;
mod evaluator;
mod function;
mod graph;
mod key;
mod node;
pub mod progress;
mod result;
mod runtime;
mod scheduler;
mod value;
mod version;

pub use cancel::CancellationToken;
pub use context::EvaluatorContext;
pub use cycle::{CycleDetector, SimpleCycleDetector};
pub use error::{
    BuildError, ComputeError, CycleInfo, ErrorInfo, EvalError, FunctionFailure, InterruptKind,
};
pub use evaluator::{inject_values, ParallelEvaluator};
pub use function::{Environment, FunctionRegistry, NodeFunction};
pub use graph::InMemoryGraph;
pub use key::{DynEq, FunctionName, Key, KeyArgument};
pub use node::{DependencyState, DirtyState, GroupedDeps, NodeEntry, NodeId};
pub use progress::{EvaluationProgressReceiver, EvaluationState, NoopProgressReceiver};
pub use result::{EvaluationResult, EvaluationResultBuilder};
pub use runtime::{EvaluationOptions, MemoizingEvaluator, MemoizingEvaluatorBuilder};
pub use scheduler::{Completion, NodeVisitor, SchedulerAbort};
pub use value::{ErrorTransienceValue, NodeValue, Value};
pub use version::Version;
