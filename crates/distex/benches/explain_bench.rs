//! Benchmarks for mask generation and explanation.
//!
//! Run with: cargo bench --bench explain_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{Array2, ArrayD, Axis, IxDyn};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use distex::all::*;

/// Create a random channels-first image for benchmarking.
fn create_synthetic_image(channels: usize, size: usize) -> ArrayD<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    ArrayD::from_shape_simple_fn(IxDyn(&[channels, size, size]), || rng.gen::<f32>())
}

/// Cheap model: per-channel sums.
fn channel_sums(batch: &ArrayD<f32>) -> Array2<f32> {
    let n = batch.len_of(Axis(0));
    let c = batch.len_of(Axis(1));
    Array2::from_shape_fn((n, c), |(i, ch)| {
        batch.index_axis(Axis(0), i).index_axis(Axis(0), ch).sum()
    })
}

fn bench_mask_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask_generation");

    for size in [32, 64, 128].iter() {
        for parallel in [false, true] {
            let generator = MaskGenerator::new(MaskSampling::default()).with_parallel(parallel);
            let name = if parallel { "parallel" } else { "sequential" };

            group.bench_with_input(BenchmarkId::new(name, size), size, |b, &size| {
                b.iter(|| {
                    let masks = generator
                        .generate(black_box(&[size, size]), 200, &[8, 8], Seed::new(0))
                        .unwrap();
                    black_box(masks)
                })
            });
        }
    }

    group.finish();
}

fn bench_explain(c: &mut Criterion) {
    let mut group = c.benchmark_group("explain");
    group.sample_size(10);

    let input = create_synthetic_image(3, 64);
    let references = Array2::from_shape_fn((4, 3), |(r, ch)| (r * 3 + ch) as f32);

    for num_masks in [100, 500].iter() {
        let config = ExplainerConfig::default()
            .with_num_masks(*num_masks)
            .with_batch_size(50)
            .with_axis_roles(AxisRoles::channels_at(0))
            .with_embedding_dim(3);
        let explainer = DistanceExplainer::new(config);

        group.bench_with_input(
            BenchmarkId::new("channels_first_64x64", num_masks),
            num_masks,
            |b, _| {
                b.iter(|| {
                    let result = explainer
                        .explain(&mut channel_sums, black_box(&input), references.view())
                        .unwrap();
                    black_box(result)
                })
            },
        );
    }

    group.finish();
}

fn bench_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");

    let masks = MaskGenerator::new(MaskSampling::default())
        .generate(&[64, 64], 1000, &[8, 8], Seed::new(1))
        .unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let distances: Vec<f32> = (0..masks.len()).map(|_| rng.gen::<f32>()).collect();
    let distances = ndarray::Array1::from(distances);

    for (name, strategy) in [
        ("coverage_weighted", AggregationStrategy::default()),
        ("rank_selection", AggregationStrategy::rank_selection()),
    ] {
        let aggregator = Aggregator::new(strategy, 0.5);
        group.bench_function(name, |b| {
            b.iter(|| black_box(aggregator.aggregate(&masks, distances.view()).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_mask_generation,
    bench_explain,
    bench_aggregation,
);
criterion_main!(benches);
