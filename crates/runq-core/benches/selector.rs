use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use runq_core::broker::selector::select;
use runq_core::broker::weight::{weight, WeightedQueue};

fn candidates(n: usize) -> Vec<WeightedQueue> {
    (0..n)
        .map(|i| WeightedQueue {
            queue: format!("{{org:o{i}}}:{{env:prod}}:queue:jobs"),
            weight: weight(1_000_000, 1_000_000 - (i as u64 * 37) % 5_000, Some(10), (i % 10) as u64),
        })
        .collect()
}

/// One weighted draw over the parent-queue candidate window.
fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_select");

    for n in [1, 10, 50, 500] {
        let queues = candidates(n);
        let mut rng = StdRng::seed_from_u64(7);
        group.bench_function(format!("{n}_queues"), |b| {
            b.iter(|| select(black_box(&queues), &mut rng));
        });
    }

    group.finish();
}

/// Draining a window by repeated draws, as dequeue does when every chosen
/// queue turns out to be full.
fn bench_redraw(c: &mut Criterion) {
    let queues = candidates(50);
    let mut rng = StdRng::seed_from_u64(7);
    c.bench_function("redraw_until_empty_50", |b| {
        b.iter(|| {
            let mut remaining = queues.clone();
            while let Some(i) = select(&remaining, &mut rng) {
                black_box(remaining.remove(i));
            }
        });
    });
}

criterion_group!(benches, bench_select, bench_redraw);
criterion_main!(benches);
