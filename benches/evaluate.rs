//! Criterion benchmarks for evaluation throughput.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use eval_flow::{ComputeError, EvaluationOptions, FunctionName, Key, MemoizingEvaluator, Value};

const INPUT: FunctionName = FunctionName::new("INPUT");
const TREE: FunctionName = FunctionName::new("TREE");

/// `TREE:(depth, index)` sums its two children, leaves reading `INPUT:index`.
fn tree_evaluator(threads: usize) -> MemoizingEvaluator {
    MemoizingEvaluator::builder()
        .function(TREE, |key, env| {
            let (depth, index) = *key.argument::<(u32, u64)>().unwrap();
            if depth == 0 {
                let Some(input) = env.get(&Key::new(INPUT, index))? else {
                    return Err(ComputeError::Missing);
                };
                return Ok(input);
            }
            let children = [
                Key::new(TREE, (depth - 1, index * 2)),
                Key::new(TREE, (depth - 1, index * 2 + 1)),
            ];
            let values = env.get_values(&children)?;
            if env.values_missing() {
                return Err(ComputeError::Missing);
            }
            let sum: u64 = values
                .iter()
                .flatten()
                .map(|value| *value.downcast_ref::<u64>().unwrap())
                .sum();
            Ok(Value::new(sum))
        })
        .threads(threads)
        .build()
        .unwrap()
}

fn inject_leaves(evaluator: &MemoizingEvaluator, depth: u32, offset: u64) {
    evaluator.inject(
        (0..1u64 << depth).map(|index| (Key::new(INPUT, index), Value::new(index + offset))),
    );
}

fn bench_clean_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("clean_build");

    for depth in [4u32, 8, 12] {
        let root = Key::new(TREE, (depth, 0u64));
        group.throughput(Throughput::Elements(1 << (depth + 1)));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter_batched(
                || {
                    let evaluator = tree_evaluator(4);
                    inject_leaves(&evaluator, depth, 0);
                    evaluator
                },
                |evaluator| {
                    evaluator
                        .evaluate(&[root.clone()], &EvaluationOptions::default())
                        .unwrap()
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_incremental_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_update");
    let depth = 10;
    let root = Key::new(TREE, (depth, 0u64));

    group.bench_function("single_leaf", |b| {
        let evaluator = tree_evaluator(4);
        inject_leaves(&evaluator, depth, 0);
        evaluator
            .evaluate(&[root.clone()], &EvaluationOptions::default())
            .unwrap();
        let mut round = 0u64;
        b.iter(|| {
            round += 1;
            evaluator.inject([(Key::new(INPUT, 0u64), Value::new(round))]);
            evaluator
                .evaluate(&[root.clone()], &EvaluationOptions::default())
                .unwrap()
        });
    });

    group.bench_function("no_change", |b| {
        let evaluator = tree_evaluator(4);
        inject_leaves(&evaluator, depth, 0);
        evaluator
            .evaluate(&[root.clone()], &EvaluationOptions::default())
            .unwrap();
        b.iter(|| {
            evaluator
                .evaluate(&[root.clone()], &EvaluationOptions::default())
                .unwrap()
        });
    });

    group.finish();
}

fn bench_threads(c: &mut Criterion) {
    let mut group = c.benchmark_group("threads");
    let depth = 10;
    let root = Key::new(TREE, (depth, 0u64));

    for threads in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &threads| {
            b.iter_batched(
                || {
                    let evaluator = tree_evaluator(threads);
                    inject_leaves(&evaluator, depth, 0);
                    evaluator
                },
                |evaluator| {
                    evaluator
                        .evaluate(&[root.clone()], &EvaluationOptions::default())
                        .unwrap()
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_clean_build,
    bench_incremental_update,
    bench_threads
);
criterion_main!(benches);
