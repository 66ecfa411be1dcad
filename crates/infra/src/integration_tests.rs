//! Integration tests for the assembled event core.
//!
//! Tests: Producer → IngestPipeline → EventStore → Projections / Router → Query
//!
//! Verifies:
//! - Appends and batches assign gap-free versions and detect conflicts
//! - Rebuilt views reflect every event in global order
//! - Subscribers resume from their cursor without losing events
//! - Cached queries always equal direct recomputation
//! - A failing view never disturbs the others

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    use proptest::prelude::*;
    use serde_json::{Value as JsonValue, json};

    use stocklens_core::{ConsumerId, ExpectedVersion, ProducerId, StreamId};
    use stocklens_events::{
        EventEnvelope, EventFilter, EventMetadata, NewEvent, Projection, ProjectionError, ProjectionRunner, QueryParams,
    };

    use crate::config::CoreConfig;
    use crate::event_store::{EventStore, InMemoryEventStore};
    use crate::health::HealthStatus;
    use crate::ingest::{BatchEvent, IngestBatch, IngestError};
    use crate::platform::EventCore;
    use crate::projections::{
        Cancellation, PortfolioHoldingsProjection, ProjectionRegistry, QueryError, RebuildOutcome, RefreshMode,
        StreamActivityProjection, ViewStatus,
    };

    const WAIT: Duration = Duration::from_secs(5);
    const AT: &str = "2026-01-05T14:30:00Z";

    fn config() -> CoreConfig {
        CoreConfig {
            batch_size: 4,
            ack_timeout_ms: 5_000,
            retry_max_attempts: 3,
            retry_base_ms: 1,
            retry_max_ms: 5,
            worker_tick_ms: 20,
            ..CoreConfig::default()
        }
    }

    fn init_tracing() {
        stocklens_observability::init_for_tests();
    }

    fn producer() -> ProducerId {
        ProducerId::new("broker-feed").unwrap()
    }

    fn created(stream: &str, expected: u64) -> BatchEvent {
        BatchEvent::new(
            stream,
            "portfolio",
            expected,
            "PortfolioCreated",
            json!({ "owner": "ana", "occurred_at": AT }),
        )
    }

    fn deposit(stream: &str, expected: u64, cents: i64) -> BatchEvent {
        BatchEvent::new(
            stream,
            "portfolio",
            expected,
            "CashDeposited",
            json!({ "amount_cents": cents, "occurred_at": AT }),
        )
    }

    fn buy(stream: &str, expected: u64, symbol: &str, quantity: i64, price_cents: i64) -> BatchEvent {
        BatchEvent::new(
            stream,
            "portfolio",
            expected,
            "TradeExecuted",
            json!({
                "symbol": symbol,
                "side": "buy",
                "quantity": quantity,
                "price_cents": price_cents,
                "occurred_at": AT,
            }),
        )
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    /// Counts events per stream; fails on any event while `failing` is set.
    struct Tripwire {
        failing: Arc<AtomicBool>,
    }

    impl Projection for Tripwire {
        type State = std::collections::BTreeMap<String, u64>;

        fn name(&self) -> &str {
            "tripwire"
        }

        fn interest(&self) -> EventFilter {
            EventFilter::all()
        }

        fn initial_state(&self) -> Self::State {
            Default::default()
        }

        fn apply(&self, state: &mut Self::State, event: &EventEnvelope) -> Result<(), ProjectionError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProjectionError::rejected(event, "tripwire armed"));
            }
            *state.entry(event.stream_id().to_string()).or_default() += 1;
            Ok(())
        }
    }

    #[test]
    fn append_assigns_global_version_then_conflicts_on_stale_expectation() {
        init_tracing();
        let core = EventCore::start(config()).unwrap();
        let id = StreamId::new("portfolio-1").unwrap();
        let payload = json!({ "owner": "ana", "occurred_at": AT });

        let gv = core
            .append(&id, "portfolio", ExpectedVersion::exact(0), "PortfolioCreated", payload.clone(), EventMetadata::new())
            .unwrap();
        assert_eq!(gv, 1);

        let err = core
            .append(&id, "portfolio", ExpectedVersion::exact(0), "PortfolioCreated", payload, EventMetadata::new())
            .unwrap_err();
        assert!(err.is_version_conflict());
        assert_eq!(core.head().unwrap(), 1);
        assert_eq!(core.read_stream(&id, 1).unwrap().len(), 1);
    }

    #[test]
    fn batch_then_rebuild_reflects_every_event_in_global_order() {
        init_tracing();
        let core = EventCore::start(config()).unwrap();
        let batch = IngestBatch::new(producer())
            .push(created("portfolio-1", 0))
            .push(created("portfolio-2", 0))
            .push(deposit("portfolio-1", 1, 10_000))
            .push(buy("portfolio-1", 2, "ACME", 3, 1_000))
            .push(deposit("portfolio-2", 1, 500));

        let report = core.submit(&batch).unwrap();
        assert!(report.is_fully_committed());
        assert_eq!(report.head, 5);

        let outcome = core
            .rebuild(PortfolioHoldingsProjection::NAME, &Cancellation::new())
            .unwrap();
        assert_eq!(outcome, RebuildOutcome::Completed { checkpoint: 5 });

        let one = core
            .query(PortfolioHoldingsProjection::NAME, &json!({ "portfolio_id": "portfolio-1" }))
            .unwrap();
        assert_eq!(one.checkpoint, 5);
        assert_eq!(one.value["cash_cents"], json!(7_000));
        assert_eq!(one.value["positions"]["ACME"], json!(3));
        assert_eq!(one.value["event_count"], json!(3));
        assert_eq!(one.value["last_global_version"], json!(4));

        let two = core
            .query(PortfolioHoldingsProjection::NAME, &json!({ "portfolio_id": "portfolio-2" }))
            .unwrap();
        assert_eq!(two.value["cash_cents"], json!(500));

        let global: Vec<u64> = core
            .read_global(1, 10)
            .unwrap()
            .iter()
            .map(EventEnvelope::global_version)
            .collect();
        assert_eq!(global, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn resubscribing_at_cursor_receives_the_rest_exactly_once() {
        init_tracing();
        let core = EventCore::start(config()).unwrap();
        let mut batch = IngestBatch::new(producer()).push(created("portfolio-1", 0));
        for v in 1..15 {
            batch = batch.push(deposit("portfolio-1", v, 1));
        }
        assert_eq!(core.submit(&batch).unwrap().head, 15);

        let alerts = ConsumerId::new("alerts").unwrap();
        let channel = core.subscribe(alerts.clone(), EventFilter::all(), 0).unwrap();
        for expected in 1..=10 {
            let delivery = channel.recv_timeout(WAIT).unwrap();
            assert_eq!(delivery.event.global_version(), expected);
            channel.ack(expected).unwrap();
        }
        // Crash after acknowledging 10; 11 may be in flight.
        drop(channel);

        let channel = core.subscribe(alerts.clone(), EventFilter::all(), 10).unwrap();
        let mut seen = Vec::new();
        while let Some(delivery) = channel.recv_timeout(Duration::from_millis(300)) {
            let gv = delivery.event.global_version();
            seen.push(gv);
            channel.ack(gv).unwrap();
        }
        assert_eq!(seen, vec![11, 12, 13, 14, 15]);
        assert!(wait_until(|| core.router().subscription(&alerts).map(|s| s.cursor) == Some(15)));
    }

    #[test]
    fn filtered_subscriber_only_sees_matching_events() {
        init_tracing();
        let core = EventCore::start(config()).unwrap();
        let channel = core
            .subscribe(
                ConsumerId::new("trade-alerts").unwrap(),
                EventFilter::event_type("TradeExecuted"),
                0,
            )
            .unwrap();

        core.submit(
            &IngestBatch::new(producer())
                .push(created("portfolio-1", 0))
                .push(buy("portfolio-1", 1, "ACME", 1, 100))
                .push(deposit("portfolio-1", 2, 5)),
        )
        .unwrap();

        let delivery = channel.recv_timeout(WAIT).unwrap();
        assert_eq!(delivery.event.event_type(), "TradeExecuted");
        assert_eq!(delivery.attempt, 1);
        channel.ack(delivery.event.global_version()).unwrap();
        assert!(channel.recv_timeout(Duration::from_millis(200)).is_none());
    }

    #[test]
    fn cached_query_matches_direct_recomputation_and_follows_commits() {
        init_tracing();
        let core = EventCore::start(config()).unwrap();
        let params = json!({ "portfolio_id": "portfolio-1" });
        core.submit(
            &IngestBatch::new(producer())
                .push(created("portfolio-1", 0))
                .push(deposit("portfolio-1", 1, 100)),
        )
        .unwrap();

        let first = core.query(PortfolioHoldingsProjection::NAME, &params).unwrap();
        let again = core.query(PortfolioHoldingsProjection::NAME, &params).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        let direct = core.engine().query(PortfolioHoldingsProjection::NAME, &params).unwrap();
        assert_eq!(*first, direct);

        core.submit(&IngestBatch::new(producer()).push(deposit("portfolio-1", 2, 50)))
            .unwrap();
        let after = core.query(PortfolioHoldingsProjection::NAME, &params).unwrap();
        assert_eq!(after.checkpoint, 3);
        assert_eq!(after.value["cash_cents"], json!(150));

        let stats = core.cache().stats();
        assert_eq!(stats.hits, 1);
        assert!(stats.invalidations >= 1);
    }

    #[test]
    fn asynchronous_view_catches_up_through_its_worker() {
        init_tracing();
        let core = EventCore::start(config()).unwrap();
        core.submit(
            &IngestBatch::new(producer())
                .push(created("portfolio-1", 0))
                .push(created("portfolio-2", 0)),
        )
        .unwrap();

        assert!(wait_until(|| {
            core.engine().checkpoint(StreamActivityProjection::NAME).ok() == Some(2)
        }));
        let counts = core
            .query(StreamActivityProjection::NAME, &json!({ "stream_type": "portfolio" }))
            .unwrap();
        assert_eq!(counts.value["streams"], json!(2));
        assert_eq!(counts.value["by_event_type"]["PortfolioCreated"], json!(2));
    }

    #[test]
    fn failing_view_goes_stale_without_disturbing_others() {
        init_tracing();
        let failing = Arc::new(AtomicBool::new(false));
        let mut registry = ProjectionRegistry::new();
        registry
            .register_with_mode(PortfolioHoldingsProjection, RefreshMode::Synchronous)
            .unwrap()
            .register_with_mode(Tripwire { failing: failing.clone() }, RefreshMode::Synchronous)
            .unwrap();
        let core = EventCore::with_registry(config(), registry).unwrap();

        core.submit(&IngestBatch::new(producer()).push(created("portfolio-1", 0)))
            .unwrap();
        failing.store(true, Ordering::SeqCst);
        let report = core
            .submit(&IngestBatch::new(producer()).push(deposit("portfolio-1", 1, 100)))
            .unwrap();
        assert!(report.is_fully_committed());

        assert_eq!(core.engine().status("tripwire").unwrap(), ViewStatus::Stale);
        assert_eq!(core.engine().checkpoint("tripwire").unwrap(), 1);
        assert!(matches!(
            core.query("tripwire", &JsonValue::Null),
            Err(QueryError::ViewStale { checkpoint: 1, .. })
        ));

        let holdings = core
            .query(PortfolioHoldingsProjection::NAME, &json!({ "portfolio_id": "portfolio-1" }))
            .unwrap();
        assert_eq!(holdings.checkpoint, 2);
        assert_eq!(holdings.value["cash_cents"], json!(100));

        let health = core.health().unwrap();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(!health.ready);
        let tripwire = health.projections.iter().find(|p| p.name == "tripwire").unwrap();
        assert_eq!(tripwire.lag, 1);
        assert!(tripwire.last_error.is_some());

        failing.store(false, Ordering::SeqCst);
        core.reset_projection("tripwire").unwrap();
        assert_eq!(core.engine().status("tripwire").unwrap(), ViewStatus::Live);
        assert_eq!(core.query("tripwire", &JsonValue::Null).unwrap().value, json!({ "portfolio-1": 2 }));
        assert!(core.health().unwrap().is_healthy());
    }

    #[test]
    fn nacked_delivery_dead_letters_then_resets() {
        init_tracing();
        let core = EventCore::start(config()).unwrap();
        let consumer = ConsumerId::new("risk-engine").unwrap();
        let channel = core.subscribe(consumer.clone(), EventFilter::all(), 0).unwrap();
        core.submit(&IngestBatch::new(producer()).push(created("portfolio-1", 0)))
            .unwrap();

        for attempt in 1..=3 {
            let delivery = channel.recv_timeout(WAIT).unwrap();
            assert_eq!(delivery.attempt, attempt);
            channel.nack(1, "downstream unavailable").unwrap();
        }
        assert!(wait_until(|| core.health().map(|h| h.status).ok() == Some(HealthStatus::Degraded)));
        assert_eq!(core.router().dead_letters().len(), 1);

        core.reset_subscription(&consumer).unwrap();
        let redelivered = channel.recv_timeout(WAIT).unwrap();
        assert_eq!(redelivered.event.global_version(), 1);
        assert_eq!(redelivered.attempt, 1);
        channel.ack(1).unwrap();
        assert!(wait_until(|| core.health().map(|h| h.is_healthy()).unwrap_or(false)));
    }

    #[test]
    fn validation_failure_is_never_persisted() {
        init_tracing();
        let core = EventCore::start(config()).unwrap();
        let id = StreamId::new("portfolio-1").unwrap();
        let err = core
            .append(&id, "portfolio", ExpectedVersion::NEW_STREAM, "PortfolioCreated", json!("x"), EventMetadata::new())
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        assert_eq!(core.head().unwrap(), 0);
    }

    #[test]
    fn durable_core_recovers_views_after_restart() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let durable = CoreConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..config()
        };

        {
            let core = EventCore::start(durable.clone()).unwrap();
            core.submit(
                &IngestBatch::new(producer())
                    .push(created("portfolio-1", 0))
                    .push(deposit("portfolio-1", 1, 2_500)),
            )
            .unwrap();
            core.shutdown();
        }

        let core = EventCore::start(durable).unwrap();
        assert_eq!(core.head().unwrap(), 2);
        let view = core
            .query(PortfolioHoldingsProjection::NAME, &json!({ "portfolio_id": "portfolio-1" }))
            .unwrap();
        assert_eq!(view.checkpoint, 2);
        assert_eq!(view.value["cash_cents"], json!(2_500));
    }

    fn history() -> impl Strategy<Value = Vec<(u8, u8, i64)>> {
        // (stream index, event kind, amount)
        prop::collection::vec((0u8..4, 0u8..3, 1i64..10_000), 1..40)
    }

    fn record(store: &InMemoryEventStore, events: &[(u8, u8, i64)]) {
        for (stream, kind, amount) in events {
            let id = StreamId::new(format!("portfolio-{stream}")).unwrap();
            let v = store.stream_version(&id).unwrap();
            let (event_type, payload) = match kind {
                0 => ("CashDeposited", json!({ "amount_cents": amount, "occurred_at": AT })),
                1 => (
                    "TradeExecuted",
                    json!({
                        "symbol": "ACME",
                        "side": "buy",
                        "quantity": amount % 7 + 1,
                        "price_cents": amount,
                        "occurred_at": AT,
                    }),
                ),
                // Unknown to the holdings view.
                _ => ("DividendPaid", json!({ "amount_cents": amount })),
            };
            store
                .append(NewEvent::new(id, "portfolio", event_type, payload), ExpectedVersion::exact(v))
                .unwrap();
        }
    }

    fn replay<P: Projection>(projection: &P, events: &[EventEnvelope]) -> Vec<u8> {
        let (state, _) = ProjectionRunner::rebuild_from_scratch(projection, events).unwrap();
        serde_json::to_vec(&state).unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 32, ..ProptestConfig::default() })]

        #[test]
        fn replaying_the_same_history_is_byte_identical(events in history()) {
            let store = InMemoryEventStore::new();
            record(&store, &events);
            let log = store.read_global(1, events.len()).unwrap();
            prop_assert_eq!(log.len(), events.len());

            prop_assert_eq!(
                replay(&PortfolioHoldingsProjection, &log),
                replay(&PortfolioHoldingsProjection, &log)
            );
            prop_assert_eq!(
                replay(&StreamActivityProjection, &log),
                replay(&StreamActivityProjection, &log)
            );
        }

        #[test]
        fn engine_rebuild_matches_direct_replay(events in history()) {
            let store = Arc::new(InMemoryEventStore::new());
            record(&store, &events);
            let log = store.read_global(1, events.len()).unwrap();

            let mut registry = ProjectionRegistry::new();
            registry.register(PortfolioHoldingsProjection).unwrap();
            let engine = crate::projections::ProjectionEngine::new(store.clone(), registry, 3);
            engine.initialize().unwrap();

            prop_assert_eq!(
                engine.state_bytes(PortfolioHoldingsProjection::NAME).unwrap(),
                replay(&PortfolioHoldingsProjection, &log)
            );
            let direct: QueryParams = JsonValue::Null;
            let answer = engine.query(PortfolioHoldingsProjection::NAME, &direct).unwrap();
            prop_assert_eq!(answer.checkpoint, events.len() as u64);
        }
    }
}
