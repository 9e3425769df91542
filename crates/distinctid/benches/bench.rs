use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use distinctid::{
    Generator, GeneratorConfig, Layout, MemoryStore, Result, RetryPolicy, generate_batch,
};
use futures::future::try_join_all;
use std::{sync::Arc, time::Instant};
use tokio::runtime::Builder;

// Number of IDs generated per benchmark iteration (per task for the
// multi-task benchmarks).
const TOTAL_IDS: usize = 4096;

fn memory_generator(buffer_size: u64) -> Generator<Arc<MemoryStore>> {
    let config = GeneratorConfig::default()
        .with_buffer_size(buffer_size)
        .with_retry(RetryPolicy::no_retry());
    Generator::new(Arc::new(MemoryStore::new()), config).unwrap()
}

/// Pure bit packing.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));

    for (name, layout) in [("twitter", Layout::TWITTER), ("legacy", Layout::LEGACY)] {
        group.bench_function(format!("{name}/elems/{TOTAL_IDS}"), |b| {
            b.iter(|| {
                for n in 0..TOTAL_IDS as u64 {
                    let id = layout
                        .encode(black_box(1_000_000 + n), 7, layout.reduce(n))
                        .unwrap();
                    black_box(layout.decode(id));
                }
            });
        });
    }

    group.finish();
}

/// One generator on one worker: a round trip per id versus buffered ranges.
fn bench_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory/sequential");
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));

    for buffer_size in [0, 64, 1024] {
        group.bench_function(format!("buffer/{buffer_size}/elems/{TOTAL_IDS}"), |b| {
            let rt = Builder::new_multi_thread()
                .enable_all()
                .worker_threads(1)
                .build()
                .unwrap();

            b.to_async(&rt).iter_custom(|iters| async move {
                let start = Instant::now();
                for _ in 0..iters {
                    let mut generator = memory_generator(buffer_size);
                    for _ in 0..TOTAL_IDS {
                        black_box(generator.distinct_async(1).await.unwrap());
                    }
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

/// One allocation, `TOTAL_IDS` stamps.
fn bench_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory/batch");
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));

    group.bench_function(format!("elems/{TOTAL_IDS}"), |b| {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        let generator = memory_generator(0);
        let allocator = generator.allocator();

        b.to_async(&rt).iter(|| async move {
            let ids = generate_batch(allocator, TOTAL_IDS as u64, 1, TOTAL_IDS as u64)
                .await
                .unwrap();
            black_box(ids);
        });
    });

    group.finish();
}

/// Many buffered clones on one shard, each in its own task.
fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory/contended");
    group.sample_size(10);
    group.sampling_mode(criterion::SamplingMode::Flat);

    let workers = num_cpus::get();
    for tasks in [1, workers, workers * 4] {
        group.throughput(Throughput::Elements((TOTAL_IDS * tasks) as u64));
        group.bench_function(format!("tasks/{tasks}/elems/{TOTAL_IDS}"), |b| {
            let rt = Builder::new_multi_thread()
                .enable_all()
                .worker_threads(workers)
                .build()
                .unwrap();

            b.to_async(&rt).iter_custom(move |iters| async move {
                let base = memory_generator(256);
                let start = Instant::now();

                for _ in 0..iters {
                    let handles = (0..tasks).map(|_| {
                        let mut generator = base.clone();
                        tokio::spawn(async move {
                            for _ in 0..TOTAL_IDS {
                                black_box(generator.distinct_async(3).await?);
                            }
                            Ok::<_, distinctid::Error>(())
                        })
                    });
                    for result in try_join_all(handles).await.unwrap() {
                        let outcome: Result<()> = result;
                        outcome.unwrap();
                    }
                }

                start.elapsed()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_sequential,
    bench_batch,
    bench_contended,
);
criterion_main!(benches);
