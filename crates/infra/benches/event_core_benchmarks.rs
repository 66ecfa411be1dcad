use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use serde_json::json;
use std::sync::Arc;

use stocklens_core::{ExpectedVersion, StreamId};
use stocklens_events::NewEvent;
use stocklens_infra::event_store::{EventStore, InMemoryEventStore};
use stocklens_infra::projections::{
    Cancellation, PortfolioHoldingsProjection, ProjectionEngine, ProjectionRegistry, StreamActivityProjection,
};
use stocklens_infra::query_cache::QueryCache;

const STREAMS: u64 = 16;

fn deposit(stream_id: &StreamId, cents: i64) -> NewEvent {
    NewEvent::new(
        stream_id.clone(),
        "portfolio",
        "CashDeposited",
        json!({ "amount_cents": cents, "occurred_at": "2026-01-05T14:30:00Z" }),
    )
}

/// Store with `events` deposits spread round-robin over `STREAMS` portfolios.
fn seeded_store(events: u64) -> anyhow::Result<Arc<InMemoryEventStore>> {
    let store = Arc::new(InMemoryEventStore::new());
    for i in 0..events {
        let id = StreamId::new(format!("portfolio-{}", i % STREAMS))?;
        let version = store.stream_version(&id)?;
        store.append(deposit(&id, 100), ExpectedVersion::exact(version))?;
    }
    Ok(store)
}

fn engine_over(store: Arc<InMemoryEventStore>) -> anyhow::Result<ProjectionEngine> {
    let mut registry = ProjectionRegistry::new();
    registry
        .register(PortfolioHoldingsProjection)?
        .register(StreamActivityProjection)?;
    Ok(ProjectionEngine::new(store, registry, 256))
}

fn bench_event_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_append_throughput");

    for batch_size in [1usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &size| {
            let store = InMemoryEventStore::new();
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                let id = StreamId::new(format!("portfolio-{n}")).expect("valid stream id");
                let events = (0..size).map(|_| deposit(&id, 1)).collect();
                black_box(store.append_batch(&id, ExpectedVersion::NEW_STREAM, events).expect("append"))
            });
        });
    }

    group.finish();
}

fn bench_projection_rebuild_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection_rebuild_speed");

    for event_count in [100u64, 1_000, 10_000] {
        let store = seeded_store(event_count).expect("seed store");
        let engine = engine_over(store).expect("engine");
        group.throughput(Throughput::Elements(event_count));
        group.bench_with_input(BenchmarkId::from_parameter(event_count), &engine, |b, engine| {
            b.iter(|| {
                black_box(
                    engine
                        .rebuild(PortfolioHoldingsProjection::NAME, &Cancellation::new())
                        .expect("rebuild"),
                )
            });
        });
    }

    group.finish();
}

fn bench_cached_vs_direct_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("cached_vs_direct_query");
    let store = seeded_store(5_000).expect("seed store");
    let engine = engine_over(store).expect("engine");
    engine.initialize().expect("initialize");
    let checkpoint = engine.checkpoint(PortfolioHoldingsProjection::NAME).expect("checkpoint");
    let params = json!({ "portfolio_id": "portfolio-3" });

    group.bench_function("direct", |b| {
        b.iter(|| black_box(engine.query(PortfolioHoldingsProjection::NAME, &params).expect("query")));
    });

    let cache = QueryCache::default();
    group.bench_function("cached", |b| {
        b.iter(|| {
            black_box(
                cache
                    .get_or_compute(PortfolioHoldingsProjection::NAME, &params, checkpoint, || {
                        engine.query(PortfolioHoldingsProjection::NAME, &params)
                    })
                    .expect("query"),
            )
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_event_append_throughput,
    bench_projection_rebuild_speed,
    bench_cached_vs_direct_query,
);
criterion_main!(benches);
