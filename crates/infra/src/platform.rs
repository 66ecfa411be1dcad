//! `EventCore`: the assembled event core behind one handle.
//!
//! ```text
//! producers ──► IngestPipeline ──► EventStore ──► sync views
//!                                      │
//!                                      └─► EventRouter ──► CommitNotice bus ──► async view workers
//!                                                 └──────► consumer delivery workers
//! readers ──► QueryCache ──► ProjectionEngine
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

use stocklens_core::{ConsumerId, ExpectedVersion, GlobalVersion, StreamId, StreamVersion};
use stocklens_events::{CommitNotice, EventBus, EventEnvelope, EventFilter, EventMetadata, InMemoryEventBus, QueryParams};

use crate::config::{ConfigError, CoreConfig};
use crate::event_store::read::StreamReader;
use crate::event_store::{EventStoreError, FileEventStore, InMemoryEventStore, SharedEventStore};
use crate::health::HealthReport;
use crate::ingest::{BatchReport, IngestBatch, IngestError, IngestPipeline};
use crate::projections::{
    Cancellation, EngineError, PortfolioHoldingsProjection, ProjectionEngine, ProjectionRegistry, QueryError,
    QueryResult, RebuildOutcome, RefreshMode, StreamActivityProjection, ViewStatus,
};
use crate::query_cache::QueryCache;
use crate::router::{DeliveryChannel, EventRouter, RouterError};
use crate::workers::{ProjectionWorker, WorkerHandle};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("worker thread could not be started: {0}")]
    Spawn(#[from] std::io::Error),
}

pub struct EventCore {
    config: CoreConfig,
    store: SharedEventStore,
    engine: Arc<ProjectionEngine>,
    cache: Arc<QueryCache>,
    router: Arc<EventRouter>,
    pipeline: IngestPipeline,
    workers: Mutex<Vec<WorkerHandle>>,
    started_at: Instant,
}

impl EventCore {
    /// Start with the bundled portfolio views: holdings (synchronous) and stream activity.
    pub fn start(config: CoreConfig) -> Result<Self, PlatformError> {
        let mut registry = ProjectionRegistry::new();
        registry
            .register_with_mode(PortfolioHoldingsProjection, RefreshMode::Synchronous)?
            .register(StreamActivityProjection)?;
        Self::with_registry(config, registry)
    }

    /// Open the store, bring every view up from the log and start the workers.
    pub fn with_registry(config: CoreConfig, registry: ProjectionRegistry) -> Result<Self, PlatformError> {
        config.validate()?;
        let store: SharedEventStore = match &config.data_dir {
            Some(dir) => Arc::new(FileEventStore::open(dir)?),
            None => Arc::new(InMemoryEventStore::new()),
        };
        Self::with_store(config, store, registry)
    }

    pub fn with_store(
        config: CoreConfig,
        store: SharedEventStore,
        registry: ProjectionRegistry,
    ) -> Result<Self, PlatformError> {
        config.validate()?;

        let cache = Arc::new(QueryCache::new(config.cache_capacity));
        let engine = Arc::new(ProjectionEngine::new(store.clone(), registry, config.batch_size));
        engine.add_listener(cache.clone());
        engine.initialize()?;

        let bus = Arc::new(InMemoryEventBus::<CommitNotice>::new());
        let router = Arc::new(EventRouter::new(store.clone(), bus.clone(), config.router_settings()));
        let pipeline = IngestPipeline::new(store.clone(), engine.clone(), router.clone());

        let mut workers = Vec::new();
        for view in engine.views_with_mode(RefreshMode::Asynchronous) {
            match ProjectionWorker::spawn(engine.clone(), view, bus.subscribe(), config.worker_tick()) {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    engine.halt();
                    workers.into_iter().for_each(WorkerHandle::shutdown);
                    router.shutdown();
                    return Err(err.into());
                }
            }
        }

        info!(
            head = store.head()?,
            views = engine.view_names().len(),
            workers = workers.len(),
            durable = config.data_dir.is_some(),
            "event core started"
        );
        Ok(Self {
            config,
            store,
            engine,
            cache,
            router,
            pipeline,
            workers: Mutex::new(workers),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedEventStore {
        &self.store
    }

    pub fn engine(&self) -> &Arc<ProjectionEngine> {
        &self.engine
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn append(
        &self,
        stream_id: &StreamId,
        stream_type: &str,
        expected: ExpectedVersion,
        event_type: &str,
        payload: JsonValue,
        metadata: EventMetadata,
    ) -> Result<GlobalVersion, IngestError> {
        self.pipeline
            .append(stream_id, stream_type, expected, event_type, payload, metadata)
    }

    pub fn submit(&self, batch: &IngestBatch) -> Result<BatchReport, IngestError> {
        self.pipeline.submit(batch)
    }

    /// Every event of the stream from `from_version` on.
    pub fn read_stream(&self, stream_id: &StreamId, from_version: StreamVersion) -> Result<Vec<EventEnvelope>, EventStoreError> {
        StreamReader::new(&self.store, stream_id.clone(), from_version, self.config.batch_size).collect()
    }

    pub fn read_global(&self, from_global_version: GlobalVersion, limit: usize) -> Result<Vec<EventEnvelope>, EventStoreError> {
        self.store.read_global(from_global_version, limit)
    }

    pub fn head(&self) -> Result<GlobalVersion, EventStoreError> {
        self.store.head()
    }

    pub fn subscribe(
        &self,
        consumer_id: ConsumerId,
        filter: EventFilter,
        start_cursor: GlobalVersion,
    ) -> Result<DeliveryChannel, RouterError> {
        self.router.subscribe(consumer_id, filter, start_cursor)
    }

    pub fn unsubscribe(&self, consumer_id: &ConsumerId) -> Result<(), RouterError> {
        self.router.unsubscribe(consumer_id)
    }

    pub fn reset_subscription(&self, consumer_id: &ConsumerId) -> Result<(), RouterError> {
        self.router.reset_subscription(consumer_id)
    }

    /// Query a view, served from the cache while the view is Live.
    ///
    /// Views that are not Live are queried directly so their status error surfaces.
    pub fn query(&self, view: &str, params: &QueryParams) -> Result<Arc<QueryResult>, QueryError> {
        let checkpoint = match (self.engine.status(view), self.engine.checkpoint(view)) {
            (Ok(ViewStatus::Live), Ok(checkpoint)) => checkpoint,
            _ => return self.engine.query(view, params).map(Arc::new),
        };
        self.cache
            .get_or_compute(view, params, checkpoint, || self.engine.query(view, params))
    }

    pub fn rebuild(&self, view: &str, cancel: &Cancellation) -> Result<RebuildOutcome, EngineError> {
        self.engine.rebuild(view, cancel)
    }

    pub fn reset_projection(&self, view: &str) -> Result<RebuildOutcome, EngineError> {
        self.engine.reset(view)
    }

    pub fn health(&self) -> Result<HealthReport, PlatformError> {
        Ok(HealthReport::assess(
            self.store.head()?,
            self.engine.describe()?,
            self.router.subscriptions(),
            self.cache.stats(),
            self.started_at.elapsed(),
        ))
    }

    /// Stop projection workers and delivery workers. Idempotent.
    pub fn shutdown(&self) {
        self.engine.halt();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            debug!(worker = worker.name(), "stopping worker");
            worker.shutdown();
        }
        self.router.shutdown();
    }
}

impl Drop for EventCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for EventCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventCore")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}
