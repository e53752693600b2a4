//! Benchmark for the sharded heat model
//!
//! Target: sub-microsecond access recording on the read hot path

use casgate::{Cid, HeatModel, ManualClock};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

fn bench_record_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("heat_model");
    group.throughput(Throughput::Elements(1));

    group.bench_function("record_access", |b| {
        let clock = Arc::new(ManualClock::at(1_000_000));
        let model = HeatModel::new(clock, 100_000);
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let cid = Cid::new(format!("bafy-{}", counter % 10_000));
            model.record_access(black_box(&cid));
        });
    });

    group.finish();
}

fn bench_heat_score(c: &mut Criterion) {
    let mut group = c.benchmark_group("heat_model");
    group.throughput(Throughput::Elements(1));

    // Pre-populate access history
    let clock = Arc::new(ManualClock::at(1_000_000));
    let model = HeatModel::new(clock.clone(), 100_000);
    for i in 0..10_000 {
        let cid = Cid::new(format!("bafy-{i:05}"));
        model.record_access(&cid);
        model.record_tier_hit(&cid, "memory");
    }
    clock.advance(3600);

    group.bench_function("heat_score", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let cid = Cid::new(format!("bafy-{:05}", counter % 10_000));
            black_box(model.heat_score(black_box(&cid)));
        });
    });

    group.finish();
}

fn bench_concurrent_recording(c: &mut Criterion) {
    let mut group = c.benchmark_group("heat_model");
    group.throughput(Throughput::Elements(100));

    let clock = Arc::new(ManualClock::at(1_000_000));
    let model = Arc::new(HeatModel::new(clock, 100_000));
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("concurrent_100_accesses", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let model = model.clone();
                    handles.push(tokio::spawn(async move {
                        let cid = Cid::new(format!("bafy-{:03}", i % 256));
                        model.record_access(&cid);
                        model.heat_score(&cid)
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_record_access,
    bench_heat_score,
    bench_concurrent_recording,
);
criterion_main!(benches);
