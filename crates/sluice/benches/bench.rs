use core::hint::black_box;
use core::time::Duration;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::future::try_join_all;
use sluice::{
    BatchConfig, BatchPool, Error, Job, JobId, JobQueue, PoolConfig, QueueDiscipline, WorkerPool,
};
use std::time::Instant;
use tokio::runtime::Builder;

// Jobs submitted per benchmark iteration.
const TOTAL_JOBS: usize = 4096;

const PATIENCE: Duration = Duration::from_secs(30);

/// Benchmarks the raw queue with no workers attached: push everything, then
/// pop everything.
fn bench_queue(c: &mut Criterion, group_name: &str, discipline: QueueDiscipline) {
    let mut group = c.benchmark_group(group_name);
    group.throughput(Throughput::Elements(TOTAL_JOBS as u64));

    group.bench_function(format!("elems/{}", TOTAL_JOBS), |b| {
        b.iter_custom(|iters| {
            let queue = JobQueue::new(TOTAL_JOBS, discipline);
            let start = Instant::now();

            for _ in 0..iters {
                for n in 0..TOTAL_JOBS {
                    queue.try_push(n, (n % 7) as i32).unwrap();
                }
                while let Some(n) = queue.try_pop() {
                    black_box(n);
                }
            }

            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmarks one caller awaiting each job in turn.
fn bench_pool_sequential(c: &mut Criterion, group_name: &str, workers: usize) {
    let mut group = c.benchmark_group(group_name);
    group.throughput(Throughput::Elements(TOTAL_JOBS as u64));

    group.bench_function(format!("elems/{}/workers/{}", TOTAL_JOBS, workers), |b| {
        let rt = Builder::new_multi_thread().enable_all().build().unwrap();

        b.to_async(&rt).iter_custom(|iters| async move {
            let pool = WorkerPool::new(PoolConfig::new(workers), |_id: JobId, n: usize| async move {
                Ok::<_, Error>(black_box(n))
            })
            .unwrap();
            let start = Instant::now();

            for _ in 0..iters {
                for n in 0..TOTAL_JOBS {
                    let out = pool.submit_and_await(Job::new(n), PATIENCE).await.unwrap();
                    black_box(out);
                }
            }

            let elapsed = start.elapsed();
            pool.shutdown().await;
            elapsed
        });
    });

    group.finish();
}

/// Benchmarks many concurrent callers sharing one pool.
fn bench_pool_concurrent(c: &mut Criterion, group_name: &str) {
    let mut group = c.benchmark_group(group_name);
    group.sample_size(10);
    group.sampling_mode(criterion::SamplingMode::Flat);

    for callers in [1, 4, 16, 64, 256] {
        let jobs_per_caller = TOTAL_JOBS / callers;

        group.throughput(Throughput::Elements(TOTAL_JOBS as u64));
        group.bench_function(format!("elems/{}/callers/{}", TOTAL_JOBS, callers), |b| {
            let rt = Builder::new_multi_thread().enable_all().build().unwrap();

            b.to_async(&rt).iter_custom(move |iters| async move {
                let pool = WorkerPool::new(
                    PoolConfig::new(num_cpus::get()).with_queue_capacity(TOTAL_JOBS),
                    |_id: JobId, n: usize| async move { Ok::<_, Error>(black_box(n)) },
                )
                .unwrap();
                let start = Instant::now();

                for _ in 0..iters {
                    let mut tasks = Vec::with_capacity(callers);
                    for _ in 0..callers {
                        let pool = pool.clone();
                        tasks.push(tokio::spawn(async move {
                            for n in 0..jobs_per_caller {
                                let out = pool.submit_and_await(Job::new(n), PATIENCE).await?;
                                black_box(out);
                            }
                            Ok::<_, Error>(())
                        }));
                    }

                    for result in try_join_all(tasks).await.unwrap() {
                        result.unwrap();
                    }
                }

                let elapsed = start.elapsed();
                pool.shutdown().await;
                elapsed
            });
        });
    }

    group.finish();
}

/// Benchmarks a batch pool where every job lands in a full batch.
fn bench_batch_pool(c: &mut Criterion, group_name: &str, max_batch_size: usize) {
    let mut group = c.benchmark_group(group_name);
    group.throughput(Throughput::Elements(TOTAL_JOBS as u64));

    group.bench_function(format!("elems/{}/batch/{}", TOTAL_JOBS, max_batch_size), |b| {
        let rt = Builder::new_multi_thread().enable_all().build().unwrap();

        b.to_async(&rt).iter_custom(|iters| async move {
            let pool = BatchPool::new(
                PoolConfig::new(2).with_queue_capacity(TOTAL_JOBS),
                BatchConfig::new(max_batch_size, Duration::from_millis(1)),
                |batch: Vec<(JobId, usize)>| async move {
                    batch
                        .into_iter()
                        .map(|(_, n)| Ok::<_, Error>(black_box(n)))
                        .collect::<Vec<_>>()
                },
            )
            .unwrap();
            let start = Instant::now();

            for _ in 0..iters {
                let receivers: Vec<_> = (0..TOTAL_JOBS)
                    .map(|n| {
                        let mut job = Job::new(n);
                        let rx = job.reply_channel();
                        pool.try_submit(job).unwrap();
                        rx
                    })
                    .collect();
                for rx in receivers {
                    black_box(rx.await.unwrap().unwrap());
                }
            }

            let elapsed = start.elapsed();
            pool.shutdown().await;
            elapsed
        });
    });

    group.finish();
}

fn benchmark_queue_fifo(c: &mut Criterion) {
    bench_queue(c, "queue/fifo", QueueDiscipline::Fifo);
}

fn benchmark_queue_priority(c: &mut Criterion) {
    bench_queue(c, "queue/priority", QueueDiscipline::Priority);
}

fn benchmark_pool_sequential_single(c: &mut Criterion) {
    bench_pool_sequential(c, "pool/sequential", 1);
}

fn benchmark_pool_sequential_many(c: &mut Criterion) {
    bench_pool_sequential(c, "pool/sequential", num_cpus::get());
}

fn benchmark_pool_concurrent(c: &mut Criterion) {
    bench_pool_concurrent(c, "pool/concurrent");
}

fn benchmark_batch_pool(c: &mut Criterion) {
    bench_batch_pool(c, "pool/batch", 64);
}

criterion_group!(
    benches,
    // Queue only
    benchmark_queue_fifo,
    benchmark_queue_priority,
    // Single job round trips
    benchmark_pool_sequential_single,
    benchmark_pool_sequential_many,
    benchmark_pool_concurrent,
    // Batching
    benchmark_batch_pool,
);
criterion_main!(benches);
