//! Benchmarks for graph expansion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shellflow::pipeline::ExecutionPlan;
use shellflow::stages::{ShellStage, StageRef};

fn chain(len: usize) -> StageRef {
    (1..len).fold(
        ShellStage::new("s0").output("/nonexistent/s0").into_ref(),
        |prev, i| {
            ShellStage::new(format!("s{i}"))
                .requires(prev)
                .output(format!("/nonexistent/s{i}").as_str())
                .into_ref()
        },
    )
}

/// A diamond lattice: every stage of a layer requires every stage of the
/// layer below, so memoisation decides the cost.
fn lattice(layers: usize, width: usize) -> StageRef {
    let mut below: Vec<StageRef> = Vec::new();
    for layer in 0..layers {
        below = (0..width)
            .map(|w| {
                below
                    .iter()
                    .cloned()
                    .fold(ShellStage::new(format!("l{layer}_{w}")), ShellStage::requires)
                    .output(format!("/nonexistent/l{layer}_{w}").as_str())
                    .into_ref()
            })
            .collect();
    }
    below
        .into_iter()
        .fold(ShellStage::new("top"), ShellStage::requires)
        .output("/nonexistent/top")
        .into_ref()
}

fn expansion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("expand");
    for len in [10, 100, 500] {
        let terminal = chain(len);
        group.bench_with_input(BenchmarkId::new("chain", len), &terminal, |b, t| {
            b.iter(|| black_box(ExecutionPlan::build(std::slice::from_ref(t))));
        });
    }
    for layers in [4, 8] {
        let terminal = lattice(layers, 8);
        group.bench_with_input(BenchmarkId::new("lattice", layers), &terminal, |b, t| {
            b.iter(|| black_box(ExecutionPlan::build(std::slice::from_ref(t))));
        });
    }
    group.finish();
}

criterion_group!(benches, expansion_benchmark);
criterion_main!(benches);
