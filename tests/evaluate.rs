//! Tests for scheduling, caching and progress reporting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use eval_flow::{
    ComputeError, EvaluationOptions, EvaluationProgressReceiver, EvaluationState, FunctionName,
    Key, MemoizingEvaluator, Value,
};

const INPUT: FunctionName = FunctionName::new("INPUT");
const CONST: FunctionName = FunctionName::new("CONST");
const SUM: FunctionName = FunctionName::new("SUM");

fn input(name: &'static str) -> Key {
    Key::new(INPUT, name)
}

#[derive(Default)]
struct Recorder {
    evaluated: Mutex<Vec<(Key, EvaluationState)>>,
    injected: Mutex<Vec<Key>>,
    enqueued: AtomicUsize,
}

impl Recorder {
    fn take_evaluated(&self) -> Vec<(Key, EvaluationState)> {
        std::mem::take(&mut *self.evaluated.lock())
    }

    fn state_of(evaluated: &[(Key, EvaluationState)], key: &Key) -> Vec<EvaluationState> {
        evaluated
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, state)| *state)
            .collect()
    }
}

impl EvaluationProgressReceiver for Recorder {
    fn enqueueing(&self, _key: &Key) {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
    }

    fn evaluated(&self, key: &Key, _value: Option<&Value>, state: EvaluationState) {
        self.evaluated.lock().push((key.clone(), state));
    }

    fn injected(&self, key: &Key) {
        self.injected.lock().push(key.clone());
    }
}

/// `SUM:n` adds `INPUT:"leaf"` to `SUM:n-1`, `SUM:0` being `INPUT:"leaf"` itself.
fn chain_evaluator(recorder: Arc<Recorder>, calls: Arc<AtomicUsize>) -> MemoizingEvaluator {
    MemoizingEvaluator::builder()
        .function(SUM, move |key, env| {
            calls.fetch_add(1, Ordering::SeqCst);
            let n = *key.argument::<u32>().unwrap();
            let Some(leaf) = env.get(&input("leaf"))? else {
                return Err(ComputeError::Missing);
            };
            let leaf = *leaf.downcast_ref::<i64>().unwrap();
            if n == 0 {
                return Ok(Value::new(leaf));
            }
            let Some(prev) = env.get(&Key::new(SUM, n - 1))? else {
                return Err(ComputeError::Missing);
            };
            Ok(Value::new(prev.downcast_ref::<i64>().unwrap() + leaf))
        })
        .progress_receiver(recorder)
        .threads(4)
        .build()
        .unwrap()
}

// =============================================================================
// Basic Evaluation Tests
// =============================================================================

#[test]
fn test_evaluates_chain() {
    let recorder = Arc::new(Recorder::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let evaluator = chain_evaluator(recorder.clone(), calls.clone());
    evaluator.inject([(input("leaf"), Value::new(2i64))]);

    let key = Key::new(SUM, 9u32);
    let result = evaluator
        .evaluate(&[key.clone()], &EvaluationOptions::default())
        .unwrap();

    assert_eq!(result.get_as::<i64>(&key), Some(&20));
    assert!(!result.has_error());
    assert!(result.cycle_roots().is_empty());
    assert!(recorder.injected.lock().contains(&input("leaf")));
    // Every node is computed at least once, and restarted at most once per dependency.
    let calls = calls.load(Ordering::SeqCst);
    assert!((10..=30).contains(&calls), "unexpected call count {}", calls);
}

#[test]
fn test_built_and_clean_scenario() {
    let recorder = Arc::new(Recorder::default());
    let evaluator = MemoizingEvaluator::builder()
        .function(CONST, |_key, _env| Ok(Value::new(42i32)))
        .progress_receiver(recorder.clone())
        .build()
        .unwrap();
    let x = input("x");
    let y = Key::new(CONST, "y");

    evaluator.inject([(x.clone(), Value::new(1i32))]);
    evaluator
        .evaluate(&[x.clone()], &EvaluationOptions::default())
        .unwrap();
    recorder.take_evaluated();

    let result = evaluator
        .evaluate(&[x.clone(), y.clone()], &EvaluationOptions::default())
        .unwrap();
    assert_eq!(result.get_as::<i32>(&x), Some(&1));
    assert_eq!(result.get_as::<i32>(&y), Some(&42));

    let evaluated = recorder.take_evaluated();
    assert_eq!(Recorder::state_of(&evaluated, &x), vec![EvaluationState::Clean]);
    assert_eq!(Recorder::state_of(&evaluated, &y), vec![EvaluationState::Built]);
}

#[test]
fn test_fast_path_dispatches_nothing() {
    let recorder = Arc::new(Recorder::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let evaluator = chain_evaluator(recorder.clone(), calls.clone());
    evaluator.inject([(input("leaf"), Value::new(1i64))]);

    let keys = [Key::new(SUM, 3u32), Key::new(SUM, 1u32)];
    evaluator
        .evaluate(&keys, &EvaluationOptions::default())
        .unwrap();
    recorder.take_evaluated();
    let calls_before = calls.load(Ordering::SeqCst);
    let enqueued_before = recorder.enqueued.load(Ordering::SeqCst);

    let result = evaluator
        .evaluate(&keys, &EvaluationOptions::default())
        .unwrap();
    assert_eq!(result.get_as::<i64>(&keys[0]), Some(&4));
    assert_eq!(result.get_as::<i64>(&keys[1]), Some(&2));

    assert_eq!(calls.load(Ordering::SeqCst), calls_before);
    assert_eq!(recorder.enqueued.load(Ordering::SeqCst), enqueued_before);
    let evaluated = recorder.take_evaluated();
    assert_eq!(evaluated.len(), 2);
    for key in &keys {
        assert_eq!(Recorder::state_of(&evaluated, key), vec![EvaluationState::Clean]);
    }
}

#[test]
fn test_idempotent_evaluation() {
    let recorder = Arc::new(Recorder::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let evaluator = chain_evaluator(recorder, calls);
    evaluator.inject([(input("leaf"), Value::new(5i64))]);

    let keys: Vec<Key> = (0..5u32).map(|n| Key::new(SUM, n)).collect();
    let first = evaluator
        .evaluate(&keys, &EvaluationOptions::default())
        .unwrap();
    let versions: Vec<_> = keys
        .iter()
        .map(|key| evaluator.graph().get(key).unwrap().version())
        .collect();

    let second = evaluator
        .evaluate(&keys, &EvaluationOptions::default())
        .unwrap();
    for (key, version) in keys.iter().zip(versions) {
        assert_eq!(first.get(key), second.get(key));
        assert_eq!(evaluator.graph().get(key).unwrap().version(), version);
    }
}

#[test]
fn test_duplicate_requested_keys() {
    let evaluator = MemoizingEvaluator::builder()
        .function(CONST, |_key, _env| Ok(Value::new("c")))
        .build()
        .unwrap();
    let key = Key::new(CONST, 1u8);
    let result = evaluator
        .evaluate(&[key.clone(), key.clone()], &EvaluationOptions::default())
        .unwrap();
    assert_eq!(result.values().len(), 1);
    assert_eq!(result.get_as::<&str>(&key), Some(&"c"));
}

// =============================================================================
// Parallelism Tests
// =============================================================================

#[test]
fn test_diamond_computes_shared_dependency_once() {
    const NODE: FunctionName = FunctionName::new("NODE");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let evaluator = MemoizingEvaluator::builder()
        .function(NODE, move |key, env| {
            let name = *key.argument::<&str>().unwrap();
            if name == "bottom" {
                counter.fetch_add(1, Ordering::SeqCst);
                return Ok(Value::new(1u64));
            }
            let deps: Vec<Key> = match name {
                "top" => vec![Key::new(NODE, "left"), Key::new(NODE, "right")],
                _ => vec![Key::new(NODE, "bottom")],
            };
            let values = env.get_values(&deps)?;
            if env.values_missing() {
                return Err(ComputeError::Missing);
            }
            let sum: u64 = values
                .iter()
                .map(|value| *value.as_ref().unwrap().downcast_ref::<u64>().unwrap())
                .sum();
            Ok(Value::new(sum))
        })
        .threads(4)
        .build()
        .unwrap();

    let top = Key::new(NODE, "top");
    let result = evaluator
        .evaluate(&[top.clone()], &EvaluationOptions::default())
        .unwrap();
    assert_eq!(result.get_as::<u64>(&top), Some(&2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_wide_graph() {
    const LEAF: FunctionName = FunctionName::new("LEAF");
    const ROOT: FunctionName = FunctionName::new("ROOT");
    let evaluator = MemoizingEvaluator::builder()
        .function(LEAF, |key, _env| {
            let n = *key.argument::<u32>().unwrap();
            Ok(Value::new(u64::from(n)))
        })
        .function(ROOT, |_key, env| {
            let deps: Vec<Key> = (0..200u32).map(|n| Key::new(LEAF, n)).collect();
            let values = env.get_values(&deps)?;
            if env.values_missing() {
                return Err(ComputeError::Missing);
            }
            Ok(Value::new(
                values
                    .into_iter()
                    .map(|value| *value.unwrap().downcast_ref::<u64>().unwrap())
                    .sum::<u64>(),
            ))
        })
        .threads(8)
        .build()
        .unwrap();

    let root = Key::new(ROOT, ());
    let result = evaluator
        .evaluate(&[root.clone()], &EvaluationOptions::default())
        .unwrap();
    assert_eq!(result.get_as::<u64>(&root), Some(&(199 * 200 / 2)));
    assert_eq!(
        evaluator.graph().get(&root).unwrap().direct_deps().len(),
        1,
        "one get_values call forms one group"
    );
}
