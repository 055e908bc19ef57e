//! Correlation registry benchmarks
//!
//! Measures the hot path every call goes through:
//! - register + offer_response (one delivered call)
//! - orphan drops (unknown ids)
//! - register/offer from many tasks at once
//!
//! Run with: `cargo bench -p hive-shim-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use hive_shim_core::{CorrelationId, Envelope};
use hive_shim_runtime::RequestResponseMatcher;
use std::sync::Arc;

fn response(id: &CorrelationId) -> Envelope {
    let request = Envelope::request(id.clone(), "bench", Vec::new());
    Envelope::response_to(&request, vec![0; 64])
}

/// Benchmark one full register → deliver cycle
fn benchmark_register_and_deliver(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    group.throughput(Throughput::Elements(1));

    let matcher = Arc::new(RequestResponseMatcher::new());

    group.bench_function("register_deliver", |b| {
        b.iter(|| {
            let id = CorrelationId::generate();
            let pending = matcher.register(id.clone()).expect("fresh id");
            matcher.offer_response(black_box(response(&id)));
            drop(pending);
        });
    });

    let orphan = response(&CorrelationId::new("never-registered"));
    group.bench_function("orphan_drop", |b| {
        b.iter(|| matcher.offer_response(black_box(orphan.clone())));
    });

    group.finish();
}

/// Benchmark concurrent callers sharing one registry
fn benchmark_concurrent_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_concurrent");
    let runtime = tokio::runtime::Runtime::new().expect("Failed to create runtime");

    for tasks in [10_u64, 100] {
        group.throughput(Throughput::Elements(tasks));
        group.bench_function(format!("{tasks}_tasks"), |b| {
            b.to_async(&runtime).iter(|| async move {
                let matcher = Arc::new(RequestResponseMatcher::new());
                let handles: Vec<_> = (0..tasks)
                    .map(|_| {
                        let matcher = Arc::clone(&matcher);
                        tokio::spawn(async move {
                            let id = CorrelationId::generate();
                            let pending = matcher.register(id.clone()).expect("fresh id");
                            matcher.offer_response(response(&id));
                            pending.wait().await.expect("delivered");
                        })
                    })
                    .collect();

                for handle in handles {
                    handle.await.expect("Task failed");
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_register_and_deliver, benchmark_concurrent_calls);
criterion_main!(benches);
