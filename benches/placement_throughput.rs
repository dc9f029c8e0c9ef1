//! Placement throughput benchmarks.
//!
//! Measures submit (place + reserve) and submit/complete cycles against
//! fleets of different sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gg_dispatch::protocol::ChatCompletionRequest;
use gg_dispatch::registry::RunnerReport;
use gg_dispatch::scheduler::{
    Dispatcher, DispatcherConfig, InferenceRequest, PendingQueueConfig, SchedulingStrategy,
};

fn create_request(model: &str) -> InferenceRequest {
    InferenceRequest::new(
        "bench-owner",
        ChatCompletionRequest { model: model.to_string(), ..Default::default() },
        1,
    )
}

fn fleet(runners: usize, strategy: SchedulingStrategy) -> Dispatcher {
    let dispatcher = Dispatcher::new(DispatcherConfig {
        strategy,
        queue: PendingQueueConfig { capacity: 10_000 },
        ..Default::default()
    });
    for i in 0..runners {
        dispatcher.update_runner(RunnerReport::new(format!("runner-{i}"), 1_000_000).with_model("llama3", 0));
    }
    dispatcher
}

fn bench_submit_complete(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_complete");

    for strategy in [SchedulingStrategy::MaxSpread, SchedulingStrategy::BinPack] {
        for runners in [1, 16, 128] {
            let dispatcher = fleet(runners, strategy);
            group.throughput(Throughput::Elements(1));
            group.bench_function(BenchmarkId::new(strategy.to_string(), runners), |b| {
                b.iter(|| {
                    let submission = dispatcher.submit(black_box(create_request("llama3"))).unwrap();
                    dispatcher.complete(submission.request_id).unwrap();
                })
            });
        }
    }

    group.finish();
}

fn bench_queue_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_drain");

    for queued in [10, 100, 1000] {
        group.throughput(Throughput::Elements(queued as u64));
        group.bench_function(BenchmarkId::new("register_runner", queued), |b| {
            b.iter(|| {
                let dispatcher = fleet(0, SchedulingStrategy::MaxSpread);
                for _ in 0..queued {
                    dispatcher.submit(create_request("llama3")).unwrap();
                }
                dispatcher.update_runner(RunnerReport::new("late", 1_000_000));
                black_box(dispatcher.queue_len());
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_submit_complete, bench_queue_drain);
criterion_main!(benches);
